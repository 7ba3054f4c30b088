//! Coalescing fan-out of the latest engine state to many viewers.
//!
//! Every subscriber owns one pending slot per [`DataClass`]. A publish overwrites the pending
//! value rather than enqueueing it, so a slow subscriber only ever sees the freshest state and
//! publishing never waits on any subscriber.

use crate::{
    bar::Bar,
    config::ThrottleConfig,
    correlation::CorrelationSnapshot,
    supervisor::SourceHealth,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

/// Everything a viewer needs to render the current state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SnapshotSet {
    pub as_of: DateTime<Utc>,
    /// Latest bar per symbol per timeframe (the open bar when one exists).
    pub bars: Vec<Bar>,
    pub correlations: Vec<CorrelationSnapshot>,
    pub health: Vec<SourceHealth>,
    /// True whenever any source is not connected.
    pub stale: bool,
}

/// Independently throttled categories of published data.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Display)]
pub enum DataClass {
    Health,
    Correlation,
    Price,
}

impl DataClass {
    /// Delivery priority order.
    pub const ALL: [DataClass; 3] = [DataClass::Health, DataClass::Correlation, DataClass::Price];

    fn index(self) -> usize {
        match self {
            DataClass::Health => 0,
            DataClass::Correlation => 1,
            DataClass::Price => 2,
        }
    }

    fn interval(self, throttle: &ThrottleConfig) -> Duration {
        match self {
            DataClass::Health => throttle.health,
            DataClass::Correlation => throttle.correlation,
            DataClass::Price => throttle.price,
        }
    }
}

/// One message pushed to a viewer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerUpdate {
    Price {
        as_of: DateTime<Utc>,
        bars: Vec<Bar>,
    },
    Correlation {
        as_of: DateTime<Utc>,
        correlations: Vec<CorrelationSnapshot>,
    },
    Health {
        as_of: DateTime<Utc>,
        health: Vec<SourceHealth>,
        stale: bool,
    },
}

impl ViewerUpdate {
    pub fn class(&self) -> DataClass {
        match self {
            ViewerUpdate::Price { .. } => DataClass::Price,
            ViewerUpdate::Correlation { .. } => DataClass::Correlation,
            ViewerUpdate::Health { .. } => DataClass::Health,
        }
    }

    fn from_snapshot(class: DataClass, snapshot: &SnapshotSet) -> Self {
        match class {
            DataClass::Price => ViewerUpdate::Price {
                as_of: snapshot.as_of,
                bars: snapshot.bars.clone(),
            },
            DataClass::Correlation => ViewerUpdate::Correlation {
                as_of: snapshot.as_of,
                correlations: snapshot.correlations.clone(),
            },
            DataClass::Health => ViewerUpdate::Health {
                as_of: snapshot.as_of,
                health: snapshot.health.clone(),
                stale: snapshot.stale,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    updates: [Option<ViewerUpdate>; 3],
    hub_closed: bool,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Mutex<Pending>,
    notify: Notify,
    /// Set when the [`Subscription`] is dropped. Pruned on the next publish.
    closed: AtomicBool,
}

impl Slot {
    fn offer(&self, classes: &[DataClass], snapshot: &SnapshotSet) {
        {
            let mut pending = self.pending.lock();
            for class in classes {
                pending.updates[class.index()] = Some(ViewerUpdate::from_snapshot(*class, snapshot));
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.pending.lock().hub_closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug, Default)]
struct HubState {
    latest: Option<SnapshotSet>,
    slots: Vec<Arc<Slot>>,
    closed: bool,
}

#[derive(Debug)]
struct HubInner {
    throttle: ThrottleConfig,
    state: Mutex<HubState>,
}

/// Cheaply cloneable handle to the hub. Publishers and subscribers may live on any task.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(throttle: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                throttle,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Publish a new [`SnapshotSet`]. Only the data classes that changed since the previous
    /// publish are offered to subscribers. Never blocks on subscribers.
    ///
    /// Returns the number of live subscribers after pruning dropped ones.
    pub fn publish(&self, snapshot: SnapshotSet) -> usize {
        let mut state = self.inner.state.lock();
        if state.closed {
            return 0;
        }

        let changed = match &state.latest {
            None => DataClass::ALL.to_vec(),
            Some(previous) => changed_classes(previous, &snapshot),
        };

        let before = state.slots.len();
        state.slots.retain(|slot| !slot.closed.load(Ordering::Acquire));
        if state.slots.len() < before {
            debug!(pruned = before - state.slots.len(), "pruned dropped subscribers");
        }

        if !changed.is_empty() {
            for slot in &state.slots {
                slot.offer(&changed, &snapshot);
            }
        }

        state.latest = Some(snapshot);
        state.slots.len()
    }

    /// Subscribe with the hub's default per-class throttle.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with(self.inner.throttle.clone())
    }

    /// Subscribe with a custom per-class throttle. The new slot is primed with the latest state.
    pub fn subscribe_with(&self, throttle: ThrottleConfig) -> Subscription {
        let slot = Arc::new(Slot::default());
        let mut state = self.inner.state.lock();

        if let Some(latest) = &state.latest {
            slot.offer(&DataClass::ALL, latest);
        }
        if state.closed {
            slot.close();
        } else {
            state.slots.push(Arc::clone(&slot));
        }

        Subscription {
            slot,
            throttle,
            last_delivery: [None; 3],
        }
    }

    /// Latest published [`SnapshotSet`], if any.
    pub fn latest(&self) -> Option<SnapshotSet> {
        self.inner.state.lock().latest.clone()
    }

    /// Number of live subscribers. Prunes dropped ones.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.slots.retain(|slot| !slot.closed.load(Ordering::Acquire));
        state.slots.len()
    }

    /// Close the hub. Subscribers drain what is pending, then receive `None`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for slot in state.slots.drain(..) {
            slot.close();
        }
    }
}

fn changed_classes(previous: &SnapshotSet, next: &SnapshotSet) -> Vec<DataClass> {
    DataClass::ALL
        .into_iter()
        .filter(|class| match class {
            DataClass::Price => previous.bars != next.bars,
            DataClass::Correlation => previous.correlations != next.correlations,
            DataClass::Health => previous.health != next.health || previous.stale != next.stale,
        })
        .collect()
}

/// One viewer's coalescing, throttled view of the [`BroadcastHub`].
#[derive(Debug)]
pub struct Subscription {
    slot: Arc<Slot>,
    throttle: ThrottleConfig,
    last_delivery: [Option<Instant>; 3],
}

impl Subscription {
    /// Wait for the next [`ViewerUpdate`] whose class is outside its throttle interval.
    ///
    /// Returns `None` once the hub is closed and nothing deliverable remains. Cancel safe.
    pub async fn recv(&mut self) -> Option<ViewerUpdate> {
        loop {
            let notified = self.slot.notify.notified();

            let next_ready = {
                let now = Instant::now();
                let mut pending = self.slot.pending.lock();
                let mut next_ready: Option<Instant> = None;

                for class in DataClass::ALL {
                    if pending.updates[class.index()].is_none() {
                        continue;
                    }

                    let ready_at = self.last_delivery[class.index()]
                        .map(|last| last + class.interval(&self.throttle))
                        .unwrap_or(now);

                    if ready_at <= now {
                        self.last_delivery[class.index()] = Some(now);
                        return pending.updates[class.index()].take();
                    }
                    next_ready = Some(next_ready.map_or(ready_at, |next| next.min(ready_at)));
                }

                if pending.hub_closed && next_ready.is_none() {
                    return None;
                }
                next_ready
            };

            match next_ready {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Number of data classes currently pending (at most one value per class).
    pub fn pending(&self) -> usize {
        self.slot
            .pending
            .lock()
            .updates
            .iter()
            .filter(|update| update.is_some())
            .count()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.closed.store(true, Ordering::Release);
    }
}
