//! Pairing of the two symbols' closed bars into return samples.

use crate::{bar::BarClosed, timeframe::Timeframe};
use chrono::{DateTime, TimeDelta, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Which half of the correlated pair a bar belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Display)]
pub enum Side {
    A,
    B,
}

/// One bucket's aligned return pair across both tracked symbols.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct PairedSample {
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub return_a: f64,
    pub return_b: f64,
}

/// Final outcome of a bucket.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize, Display)]
pub enum Resolution {
    Paired,
    /// Counterpart not confirmed within the grace period.
    Timeout,
    /// A leg came from a source that was not connected.
    Stale,
    /// A leg was partial and the policy excludes partial bars.
    Partial,
    /// A leg had no defined return (no or zero previous close).
    NoReturn,
}

/// Running outcome counters of one [`Synchronizer`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct SyncStats {
    pub paired: u64,
    pub unpaired_timeout: u64,
    pub unpaired_stale: u64,
    pub unpaired_partial: u64,
    pub dropped_no_return: u64,
    /// Bars arriving for a bucket that was already resolved (or pruned).
    pub late: u64,
}

impl SyncStats {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Paired => self.paired += 1,
            Resolution::Timeout => self.unpaired_timeout += 1,
            Resolution::Stale => self.unpaired_stale += 1,
            Resolution::Partial => self.unpaired_partial += 1,
            Resolution::NoReturn => self.dropped_no_return += 1,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct Leg {
    bar_return: f64,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Slot {
    Pending {
        a: Option<Leg>,
        b: Option<Leg>,
        deadline: DateTime<Utc>,
    },
    Resolved(Resolution),
}

/// Aligns closed bars of both symbols for one [`Timeframe`] on identical `bucket_start`.
///
/// A sample is emitted only when both legs are closed, non-stale and have a defined return.
/// Buckets whose counterpart is not confirmed before the grace deadline are resolved as
/// unpaired. There is no synthetic fill and no carry-forward.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    timeframe: Timeframe,
    grace: TimeDelta,
    include_partial: bool,
    retention: usize,
    slots: BTreeMap<DateTime<Utc>, Slot>,
    /// Latest bucket forgotten by pruning. Unknown buckets at or before it are late.
    horizon: Option<DateTime<Utc>>,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(
        timeframe: Timeframe,
        grace: TimeDelta,
        include_partial: bool,
        retention: usize,
    ) -> Self {
        Self {
            timeframe,
            grace,
            include_partial,
            retention: retention.max(1),
            slots: BTreeMap::new(),
            horizon: None,
            stats: SyncStats::default(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Number of buckets awaiting a counterpart.
    pub fn pending(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Pending { .. }))
            .count()
    }

    /// Resolution of a remembered bucket, if it has been resolved.
    pub fn resolution(&self, bucket_start: DateTime<Utc>) -> Option<Resolution> {
        match self.slots.get(&bucket_start) {
            Some(Slot::Resolved(resolution)) => Some(*resolution),
            _ => None,
        }
    }

    /// Offer one side's sealed bar. `stale` marks a bar sealed while its source was not
    /// connected. `now` is the wall-clock time used for the grace deadline.
    pub fn on_bar_closed(
        &mut self,
        side: Side,
        closed: &BarClosed,
        stale: bool,
        now: DateTime<Utc>,
    ) -> Option<PairedSample> {
        let bucket_start = closed.bar.bucket_start;

        // A bucket still pending behind the horizon keeps its grace period
        if !self.slots.contains_key(&bucket_start)
            && self.horizon.is_some_and(|horizon| bucket_start <= horizon)
        {
            self.stats.late += 1;
            debug!(timeframe = %self.timeframe, %side, %bucket_start, "discarding bar for a pruned bucket");
            return None;
        }

        let slot = self.slots.entry(bucket_start).or_insert(Slot::Pending {
            a: None,
            b: None,
            deadline: now + self.grace,
        });

        let (a, b) = match slot {
            Slot::Resolved(resolution) => {
                self.stats.late += 1;
                debug!(
                    timeframe = %self.timeframe,
                    %side,
                    %bucket_start,
                    %resolution,
                    "discarding bar for an already resolved bucket"
                );
                return None;
            }
            Slot::Pending { a, b, .. } => (a, b),
        };

        let exclusion = if stale {
            Some(Resolution::Stale)
        } else if closed.bar.partial && !self.include_partial {
            Some(Resolution::Partial)
        } else {
            None
        };

        let outcome = match (exclusion, closed.bar_return()) {
            (None, Some(bar_return)) => {
                let leg = Some(Leg { bar_return });
                match side {
                    Side::A => *a = leg,
                    Side::B => *b = leg,
                }
                Ok((*a, *b))
            }
            (exclusion, _) => {
                let resolution = exclusion.unwrap_or(Resolution::NoReturn);
                debug!(
                    timeframe = %self.timeframe,
                    %side,
                    %bucket_start,
                    %resolution,
                    "bucket excluded from pairing"
                );
                Err(resolution)
            }
        };

        let sample = match outcome {
            Err(resolution) => {
                *slot = Slot::Resolved(resolution);
                self.stats.record(resolution);
                None
            }
            Ok((Some(leg_a), Some(leg_b))) => {
                *slot = Slot::Resolved(Resolution::Paired);
                self.stats.record(Resolution::Paired);
                Some(PairedSample {
                    timeframe: self.timeframe,
                    bucket_start,
                    return_a: leg_a.bar_return,
                    return_b: leg_b.bar_return,
                })
            }
            Ok(_) => None,
        };

        self.prune();
        sample
    }

    /// Resolve every pending bucket whose grace deadline has passed as unpaired.
    /// Returns the number of buckets resolved.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for (bucket_start, slot) in self.slots.iter_mut() {
            if let Slot::Pending { deadline, .. } = slot {
                if *deadline <= now {
                    debug!(
                        timeframe = %self.timeframe,
                        %bucket_start,
                        "counterpart missing after grace period, bucket unpaired"
                    );
                    *slot = Slot::Resolved(Resolution::Timeout);
                    expired += 1;
                }
            }
        }
        self.stats.unpaired_timeout += expired as u64;
        if expired > 0 {
            self.prune();
        }
        expired
    }

    fn prune(&mut self) {
        let resolved = self.slots.len() - self.pending();
        let excess = resolved.saturating_sub(self.retention);
        if excess == 0 {
            return;
        }

        let forgotten = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resolved(_)))
            .map(|(bucket_start, _)| *bucket_start)
            .take(excess)
            .collect::<Vec<_>>();

        for bucket_start in forgotten {
            self.slots.remove(&bucket_start);
            self.horizon = self.horizon.max(Some(bucket_start));
        }
    }
}
