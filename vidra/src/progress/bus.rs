//! In-process pub/sub fan-out for progress events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::task::ProgressEvent;

const DEFAULT_LISTENER_CAPACITY: usize = 256;
const TERMINAL_DELIVERY_DEADLINE: Duration = Duration::from_secs(1);

/// Handle returned by [`ProgressBus::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Fan-out bus with a bounded queue per listener.
///
/// `publish` never blocks the caller: a listener whose queue is full simply
/// misses the event. Terminal-status events are the exception and get a
/// short grace delivery on a detached task, so a slow consumer still sees
/// every final state.
pub struct ProgressBus {
    listeners: DashMap<u64, mpsc::Sender<ProgressEvent>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_LISTENER_CAPACITY)
    }
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionHandle, mpsc::Receiver<ProgressEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.listeners.insert(id, tx);
        (SubscriptionHandle(id), rx)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.listeners.remove(&handle.0);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Fan an event out to every listener without stalling the publisher.
    pub fn publish(&self, event: ProgressEvent) {
        let mut dropped_listeners = Vec::new();

        for entry in self.listeners.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped_listeners.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Full(event)) => {
                    if event.is_terminal() {
                        // Final states must not be lost to a momentarily full
                        // queue; retry off the publisher's path.
                        let sender = entry.value().clone();
                        tokio::spawn(async move {
                            if sender
                                .send_timeout(event, TERMINAL_DELIVERY_DEADLINE)
                                .await
                                .is_err()
                            {
                                warn!("Listener dropped a terminal progress event");
                            }
                        });
                    } else {
                        trace!("Listener queue full, progress event skipped");
                    }
                }
            }
        }

        for id in dropped_listeners {
            self.listeners.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Status;

    fn event(status: Status) -> ProgressEvent {
        ProgressEvent::task("t1", status)
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber() {
        let bus = ProgressBus::default();
        let (_h1, mut rx1) = bus.subscribe();
        let (_h2, mut rx2) = bus.subscribe();

        bus.publish(event(Status::Downloading));

        assert_eq!(rx1.recv().await.unwrap().status, Status::Downloading);
        assert_eq!(rx2.recv().await.unwrap().status, Status::Downloading);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = ProgressBus::default();
        let (handle, mut rx) = bus.subscribe();
        bus.unsubscribe(handle);
        bus.publish(event(Status::Downloading));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn full_listener_does_not_stall_publisher() {
        let bus = ProgressBus::new(1);
        let (_handle, mut rx) = bus.subscribe();

        // Queue capacity is 1; the second non-terminal event is dropped for
        // this listener but publish returns immediately.
        bus.publish(event(Status::Downloading));
        bus.publish(event(Status::Downloading));
        bus.publish(event(Status::Downloading));

        assert_eq!(rx.recv().await.unwrap().status, Status::Downloading);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_event_survives_a_full_queue() {
        let bus = ProgressBus::new(1);
        let (_handle, mut rx) = bus.subscribe();

        bus.publish(event(Status::Downloading));
        bus.publish(event(Status::Completed));

        assert_eq!(rx.recv().await.unwrap().status, Status::Downloading);
        // Delivered by the grace task once capacity frees up.
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("terminal event delivered")
            .unwrap();
        assert_eq!(second.status, Status::Completed);
    }

    #[tokio::test]
    async fn closed_listeners_are_pruned() {
        let bus = ProgressBus::default();
        let (_handle, rx) = bus.subscribe();
        drop(rx);
        bus.publish(event(Status::Downloading));
        assert_eq!(bus.listener_count(), 0);
    }
}
