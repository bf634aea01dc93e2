//! Per-(type, namespace) watch fan-out with bounded queues
//!
//! A slow subscriber never blocks the store: when its queue overflows the bus
//! marks it lagged and closes the queue. The subscriber's stream then yields
//! a terminal [`Lagged`] error, telling the consumer to re-list and
//! re-subscribe instead of assuming every event was delivered.

use super::event::Event;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// The subscriber's queue overflowed and events were dropped; re-list and
/// re-subscribe to resynchronize.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("watch queue overflowed, re-list and re-subscribe")]
pub struct Lagged;

struct Subscriber {
    tx: mpsc::Sender<Event>,
    lagged: Arc<AtomicBool>,
}

/// Fan-out state embedded in each namespace shard. Publishing happens under
/// the shard's write lock, which is what gives watchers a total order
/// consistent with commit order.
#[derive(Default)]
pub(crate) struct Bus {
    subscribers: Vec<Subscriber>,
}

impl Bus {
    /// Registers a subscriber whose stream first replays `initial` (ending in
    /// [`Event::Bootstrapped`]) and then receives live events.
    pub(crate) fn subscribe(&mut self, initial: VecDeque<Event>, depth: usize) -> WatchStream {
        let (tx, rx) = mpsc::channel(depth);
        let lagged = Arc::new(AtomicBool::new(false));
        self.subscribers.push(Subscriber {
            tx,
            lagged: lagged.clone(),
        });
        WatchStream {
            initial,
            rx,
            lagged,
            finished: false,
        }
    }

    /// Delivers `event` to every live subscriber, dropping the ones that
    /// overflowed or went away.
    pub(crate) fn publish(&mut self, event: &Event) {
        self.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.lagged.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

/// Stream of [`Event`]s for one `(type, namespace)` subscription.
///
/// Terminates with `Err(Lagged)` if the subscriber fell behind, or cleanly
/// when the store is dropped.
pub struct WatchStream {
    initial: VecDeque<Event>,
    rx: mpsc::Receiver<Event>,
    lagged: Arc<AtomicBool>,
    finished: bool,
}

impl futures::Stream for WatchStream {
    type Item = Result<Event, Lagged>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(event) = this.initial.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                this.finished = true;
                if this.lagged.load(Ordering::Acquire) {
                    Poll::Ready(Some(Err(Lagged)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Bus, Lagged};
    use crate::store::event::Event;
    use fleet_core::{machine::MachineSpec, Resource, Spec};
    use futures::StreamExt;
    use std::collections::VecDeque;

    fn machine(id: &str) -> Resource {
        Resource::new("default", id, Spec::Machine(MachineSpec::default()))
    }

    #[tokio::test]
    async fn initial_replay_precedes_live_events() {
        let mut bus = Bus::default();
        let initial = VecDeque::from([Event::Created(machine("m1")), Event::Bootstrapped]);
        let mut watch = bus.subscribe(initial, 4);
        bus.publish(&Event::Created(machine("m2")));

        assert!(matches!(watch.next().await, Some(Ok(Event::Created(r))) if r.metadata.id == "m1"));
        assert!(matches!(watch.next().await, Some(Ok(Event::Bootstrapped))));
        assert!(matches!(watch.next().await, Some(Ok(Event::Created(r))) if r.metadata.id == "m2"));
    }

    #[tokio::test]
    async fn overflow_marks_subscriber_lagged() {
        let mut bus = Bus::default();
        let mut watch = bus.subscribe(VecDeque::new(), 2);
        for i in 0..3 {
            bus.publish(&Event::Created(machine(&format!("m{i}"))));
        }
        // the two queued events are delivered, then the lag is surfaced
        assert!(watch.next().await.unwrap().is_ok());
        assert!(watch.next().await.unwrap().is_ok());
        assert!(matches!(watch.next().await, Some(Err(Lagged))));
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let mut bus = Bus::default();
        let watch = bus.subscribe(VecDeque::new(), 2);
        drop(watch);
        bus.publish(&Event::Bootstrapped);
        assert!(bus.subscribers.is_empty());
    }

    #[tokio::test]
    async fn clean_close_is_not_a_lag() {
        let mut bus = Bus::default();
        let mut watch = bus.subscribe(VecDeque::new(), 2);
        bus.publish(&Event::Created(machine("m1")));
        drop(bus);
        assert!(watch.next().await.unwrap().is_ok());
        assert!(watch.next().await.is_none());
    }
}
