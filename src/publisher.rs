//! Periodic snapshot broadcasting.
//!
//! A [`SnapshotPublisher`] polls the [`Telemetry`] facade on a background
//! thread and pushes `{ timestamp, status, metrics }` payloads to every
//! connected [`Observer`]. Observers that fail a delivery are dropped.
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::constants::{
    MAX_POLL_INTERVAL, MIN_POLL_INTERVAL, OBSERVER_CHANNEL_CAPACITY, POLL_SLEEP_STEP,
};
use crate::error::{ObserverError, TelemetryError};
use crate::history::SegmentWriter;
use crate::metrics::{MetricsSnapshot, unix_timestamp};
use crate::status::StatusDetails;
use crate::telemetry::Telemetry;

/// Receiver of serialized snapshot payloads.
pub trait Observer: Send + Sync {
    /// Delivers one payload without blocking.
    fn send(&self, payload: &str) -> Result<(), ObserverError>;

    /// Releases the observer; later sends fail with [`ObserverError::Closed`].
    fn close(&self);
}

/// [`Observer`] feeding a bounded channel.
#[derive(Debug)]
pub struct ChannelObserver {
    sender: Mutex<Option<SyncSender<String>>>,
}

impl ChannelObserver {
    /// Creates an observer with room for `capacity` undelivered payloads.
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<String>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }

    pub fn new() -> (Self, Receiver<String>) {
        Self::with_capacity(OBSERVER_CHANNEL_CAPACITY)
    }
}

impl Observer for ChannelObserver {
    fn send(&self, payload: &str) -> Result<(), ObserverError> {
        let guard = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = guard.as_ref().ok_or(ObserverError::Closed)?;
        sender.try_send(payload.to_string()).map_err(|err| match err {
            TrySendError::Full(_) => ObserverError::Full,
            TrySendError::Disconnected(_) => ObserverError::Closed,
        })
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Handle returned by [`ObserverSet::connect`].
pub type ObserverId = u64;

/// Thread-safe set of connected observers.
#[derive(Default)]
pub struct ObserverSet {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Arc<dyn Observer>)>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, Arc<dyn Observer>)>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().push((id, observer));
        debug!("observer {id} connected");
        id
    }

    /// Removes and closes an observer. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let removed = {
            let mut observers = self.lock();
            let position = observers.iter().position(|(current, _)| *current == id);
            position.map(|index| observers.remove(index))
        };
        match removed {
            Some((_, observer)) => {
                observer.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `payload` to every observer concurrently and drops the ones that
    /// failed. Returns the number of successful deliveries.
    pub fn broadcast(&self, payload: &str) -> usize {
        let targets: Vec<(ObserverId, Arc<dyn Observer>)> = self.lock().clone();
        if targets.is_empty() {
            return 0;
        }

        let failed: Vec<ObserverId> = thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|(id, observer)| (*id, scope.spawn(move || observer.send(payload))))
                .collect();
            handles
                .into_iter()
                .filter_map(|(id, handle)| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => {
                        debug!("dropping observer {id}: {err}");
                        Some(id)
                    }
                    Err(_) => {
                        warn!("dropping observer {id}: send panicked");
                        Some(id)
                    }
                })
                .collect()
        });

        if !failed.is_empty() {
            let pruned: Vec<Arc<dyn Observer>> = {
                let mut observers = self.lock();
                let (dropped, kept): (Vec<_>, Vec<_>) = observers
                    .drain(..)
                    .partition(|(id, _)| failed.contains(id));
                *observers = kept;
                dropped.into_iter().map(|(_, observer)| observer).collect()
            };
            for observer in pruned {
                observer.close();
            }
        }
        targets.len() - failed.len()
    }

    /// Closes and removes every observer.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain(..).collect();
        for (_, observer) in drained {
            observer.close();
        }
    }
}

/// Payload pushed to observers on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub timestamp: f64,
    pub status: Vec<StatusDetails>,
    pub metrics: MetricsSnapshot,
}

impl SnapshotPayload {
    /// Collects one payload from `telemetry`.
    pub fn collect(
        telemetry: &Telemetry,
        include_health: bool,
        external_limit: usize,
    ) -> Result<Self, TelemetryError> {
        Ok(Self {
            timestamp: unix_timestamp(),
            status: telemetry.status_snapshot(include_health),
            metrics: telemetry.metrics_snapshot(external_limit)?,
        })
    }
}

/// Options of a [`SnapshotPublisher`].
#[derive(Debug, Default)]
pub struct PublisherOptions {
    /// Include health verdicts in the status section.
    pub include_health: bool,
    /// Unmanaged processes included per snapshot.
    pub external_limit: usize,
    /// Also append every metrics snapshot to history segments.
    pub recorder: Option<SegmentWriter>,
}

/// Keeps the polling interval within the supported range.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// Background worker broadcasting snapshots at a fixed interval.
pub struct SnapshotPublisher {
    stop: Arc<AtomicBool>,
    observers: Arc<ObserverSet>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SnapshotPublisher {
    pub fn spawn(
        telemetry: Arc<Telemetry>,
        interval: Duration,
        options: PublisherOptions,
    ) -> Self {
        Self::spawn_with_observers(telemetry, Arc::new(ObserverSet::new()), interval, options)
    }

    /// Like [`SnapshotPublisher::spawn`], broadcasting to an existing set so
    /// observers connected beforehand receive the first payload.
    pub fn spawn_with_observers(
        telemetry: Arc<Telemetry>,
        observers: Arc<ObserverSet>,
        interval: Duration,
        options: PublisherOptions,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let interval = clamp_interval(interval);
        info!("publishing snapshots every {:.1}s", interval.as_secs_f64());

        let stop_clone = Arc::clone(&stop);
        let observers_clone = Arc::clone(&observers);
        let handle = thread::spawn(move || {
            let PublisherOptions {
                include_health,
                external_limit,
                mut recorder,
            } = options;

            while !stop_clone.load(Ordering::SeqCst) {
                match SnapshotPayload::collect(&telemetry, include_health, external_limit) {
                    Ok(payload) => {
                        if let Some(writer) = recorder.as_mut()
                            && let Err(err) = writer.append(&payload.metrics)
                        {
                            warn!("failed to record snapshot: {err}");
                        }
                        match serde_json::to_string(&payload) {
                            Ok(text) => {
                                observers_clone.broadcast(&text);
                            }
                            Err(err) => error!("failed to serialise snapshot: {err}"),
                        }
                    }
                    Err(err) => error!("failed to collect snapshot: {err}"),
                }

                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_clone.load(Ordering::SeqCst) {
                        return;
                    }
                    let step = interval.saturating_sub(slept).min(POLL_SLEEP_STEP);
                    thread::sleep(step);
                    slept += step;
                }
            }
        });

        Self {
            stop,
            observers,
            handle: Some(handle),
        }
    }

    /// Observers receiving this publisher's payloads.
    pub fn observers(&self) -> &Arc<ObserverSet> {
        &self.observers
    }

    /// Stops polling and closes every observer.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.observers.close_all();
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
