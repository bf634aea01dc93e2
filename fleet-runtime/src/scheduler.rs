//! Delays and deduplicates reconcile keys
//!
//! Incoming [`ScheduleRequest`]s are deduplicated per key: a key scheduled
//! several times before being emitted runs once, at the earliest requested
//! instant (plus an optional debounce that absorbs bursts of immediate
//! requests). Keys can be held pending while the consumer is busy with them.

use futures::{stream::Fuse, Stream, StreamExt};
use hashbrown::{hash_map::Entry, HashMap};
use pin_project::pin_project;
use std::{
    collections::HashSet,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};

/// The reconciliation unit: one key per affected output id.
pub type ReconcileKey = String;

/// A request to emit `key` no earlier than `run_at`.
#[derive(Debug)]
pub(crate) struct ScheduleRequest {
    pub(crate) key: ReconcileKey,
    pub(crate) run_at: Instant,
}

struct ScheduledEntry {
    run_at: Instant,
    queue_key: delay_queue::Key,
}

#[pin_project(project = SchedulerProj)]
pub(crate) struct Scheduler<R> {
    /// Delay queue of scheduled keys. `scheduled` holds the canonical entry
    /// per key; always go through it when manipulating the queue.
    queue: DelayQueue<ReconcileKey>,
    /// Canonical metadata per scheduled key, used for deduplication.
    scheduled: HashMap<ReconcileKey, ScheduledEntry>,
    /// Keys that expired while held back by the consumer.
    pending: HashSet<ReconcileKey>,
    #[pin]
    requests: Fuse<R>,
    /// Added to every request's expiry; an uninterrupted quiet period of this
    /// length is required before a key is emitted, deduplicating bursts of
    /// immediate requests.
    debounce: Duration,
}

impl<R: Stream> Scheduler<R> {
    fn new(requests: R, debounce: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            scheduled: HashMap::new(),
            pending: HashSet::new(),
            requests: requests.fuse(),
            debounce,
        }
    }
}

impl<'a, R> SchedulerProj<'a, R> {
    /// Schedule a key, keeping the earlier run time if it is already queued.
    fn schedule(&mut self, request: ScheduleRequest) {
        if self.pending.contains(&request.key) {
            // already expired and waiting for the consumer, nothing to expedite
            return;
        }
        let run_at = request.run_at + *self.debounce;
        match self.scheduled.entry(request.key) {
            Entry::Occupied(mut entry) if entry.get().run_at >= run_at => {
                // the new request is sooner (a fresh input event vs a backoff
                // retry): move the queued key forward
                let stored = entry.get_mut();
                self.queue.reset_at(&stored.queue_key, run_at);
                stored.run_at = run_at;
            }
            Entry::Occupied(_) => {
                // queued to run sooner already
            }
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(ScheduledEntry {
                    run_at,
                    queue_key: self.queue.insert_at(key, run_at),
                });
            }
        }
    }

    /// Pop an expired key the consumer can take, parking the ones it cannot.
    fn poll_pop(
        &mut self,
        cx: &mut Context<'_>,
        can_take: impl Fn(&ReconcileKey) -> bool,
    ) -> Poll<ReconcileKey> {
        if let Some(key) = self.pending.iter().find(|k| can_take(*k)).cloned() {
            self.pending.remove(&key);
            return Poll::Ready(key);
        }
        loop {
            match self.queue.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let key = expired.into_inner();
                    self.scheduled
                        .remove(&key)
                        .expect("expired key missing from scheduler metadata");
                    if can_take(&key) {
                        break Poll::Ready(key);
                    }
                    self.pending.insert(key);
                }
                Poll::Ready(None) | Poll::Pending => break Poll::Pending,
            }
        }
    }

    /// Move every expired key into the pending set without emitting any.
    fn park_expired(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(expired)) = self.queue.poll_expired(cx) {
            let key = expired.into_inner();
            self.scheduled
                .remove(&key)
                .expect("expired key missing from scheduler metadata");
            self.pending.insert(key);
        }
    }
}

/// See [`Scheduler::hold`].
pub(crate) struct Hold<'a, R> {
    scheduler: Pin<&'a mut Scheduler<R>>,
}

impl<'a, R> Stream for Hold<'a, R>
where
    R: Stream<Item = ScheduleRequest>,
{
    type Item = ReconcileKey;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut scheduler = this.scheduler.as_mut().project();
        loop {
            match scheduler.requests.as_mut().poll_next(cx) {
                Poll::Ready(Some(request)) => scheduler.schedule(request),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => break,
            }
        }
        scheduler.park_expired(cx);
        Poll::Pending
    }
}

/// See [`Scheduler::hold_unless`].
pub(crate) struct HoldUnless<'a, R, C> {
    scheduler: Pin<&'a mut Scheduler<R>>,
    can_take: C,
}

impl<'a, R, C> Stream for HoldUnless<'a, R, C>
where
    R: Stream<Item = ScheduleRequest>,
    C: Fn(&ReconcileKey) -> bool + Unpin,
{
    type Item = ReconcileKey;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let can_take = &this.can_take;
        let mut scheduler = this.scheduler.as_mut().project();
        loop {
            match scheduler.requests.as_mut().poll_next(cx) {
                Poll::Ready(Some(request)) => scheduler.schedule(request),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => break,
            }
        }
        match scheduler.poll_pop(cx, can_take) {
            Poll::Ready(key) => Poll::Ready(Some(key)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> Scheduler<R>
where
    R: Stream<Item = ScheduleRequest>,
{
    /// A filtered view of the scheduler: keys for which `can_take` returns
    /// `false` are parked and re-offered as soon as the consumer is ready.
    ///
    /// The view is designed to be reconstructed on every poll; no keys are
    /// lost by doing so. `can_take` runs for each parked key per poll, so
    /// keep it cheap.
    pub(crate) fn hold_unless<C: Fn(&ReconcileKey) -> bool>(
        self: Pin<&mut Self>,
        can_take: C,
    ) -> HoldUnless<'_, R, C> {
        HoldUnless {
            scheduler: self,
            can_take,
        }
    }

    /// A view that parks every expired key while still draining the request
    /// stream; used when the consumer has no free capacity at all.
    #[must_use]
    pub(crate) fn hold(self: Pin<&mut Self>) -> Hold<'_, R> {
        Hold { scheduler: self }
    }

    #[cfg(test)]
    pub(crate) fn contains_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }
}

impl<R> Stream for Scheduler<R>
where
    R: Stream<Item = ScheduleRequest>,
{
    type Item = ReconcileKey;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.hold_unless(|_| true)).poll_next(cx)
    }
}

/// Builds a [`Scheduler`] over a request stream.
///
/// Terminates as soon as `requests` does, which is how controller shutdown
/// propagates into the runner.
pub(crate) fn scheduler<R: Stream<Item = ScheduleRequest>>(
    requests: R,
    debounce: Duration,
) -> Scheduler<R> {
    Scheduler::new(requests, debounce)
}
