use super::calc::is_degenerate;
use std::collections::VecDeque;

#[derive(Debug, Copy, Clone, Default, PartialEq)]
struct RunningSums {
    a: f64,
    b: f64,
    aa: f64,
    bb: f64,
    ab: f64,
}

impl RunningSums {
    fn add(&mut self, a: f64, b: f64) {
        self.a += a;
        self.b += b;
        self.aa += a * a;
        self.bb += b * b;
        self.ab += a * b;
    }

    fn subtract(&mut self, a: f64, b: f64) {
        self.a -= a;
        self.b -= b;
        self.aa -= a * a;
        self.bb -= b * b;
        self.ab -= a * b;
    }
}

/// Sliding window of the last `capacity` return pairs with running sums for O(1) Pearson updates.
///
/// The running sums are re-derived from the window contents once every `capacity` evictions to
/// bound floating point drift.
#[derive(Debug, Clone)]
pub struct CorrelationWindow {
    capacity: usize,
    samples: VecDeque<(f64, f64)>,
    sums: RunningSums,
    evictions_since_resync: usize,
}

impl CorrelationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            sums: RunningSums::default(),
            evictions_since_resync: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a return pair, evicting the oldest first when at capacity.
    /// Returns the evicted pair, if any.
    pub fn push(&mut self, return_a: f64, return_b: f64) -> Option<(f64, f64)> {
        let evicted = if self.samples.len() >= self.capacity {
            let evicted = self.samples.pop_front();
            if let Some((a, b)) = evicted {
                self.sums.subtract(a, b);
                self.evictions_since_resync += 1;
            }
            evicted
        } else {
            None
        };

        self.samples.push_back((return_a, return_b));
        self.sums.add(return_a, return_b);

        if self.evictions_since_resync >= self.capacity {
            self.resync();
        }

        evicted
    }

    fn resync(&mut self) {
        self.sums = self
            .samples
            .iter()
            .fold(RunningSums::default(), |mut sums, (a, b)| {
                sums.add(*a, *b);
                sums
            });
        self.evictions_since_resync = 0;
    }

    /// Pearson coefficient over the running sums.
    ///
    /// `None` when fewer than two samples exist or either variance is (numerically) zero,
    /// otherwise clamped to `[-1, 1]`.
    pub fn coefficient(&self) -> Option<f64> {
        let count = self.samples.len();
        if count < 2 {
            return None;
        }

        let n = count as f64;
        let RunningSums { a, b, aa, bb, ab } = self.sums;

        let var_a = n * aa - a * a;
        let var_b = n * bb - b * b;
        if is_degenerate(var_a, n * aa) || is_degenerate(var_b, n * bb) {
            return None;
        }

        let cov = n * ab - a * b;
        let coefficient = cov / (var_a.sqrt() * var_b.sqrt());
        coefficient.is_finite().then(|| coefficient.clamp(-1.0, 1.0))
    }

    /// Window contents split into the two return series, oldest first.
    pub fn returns(&self) -> (Vec<f64>, Vec<f64>) {
        self.samples.iter().copied().unzip()
    }
}
