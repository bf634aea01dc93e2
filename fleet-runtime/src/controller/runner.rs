//! Drives reconcile passes off the scheduler, one at a time per key
//!
//! Pulls keys from a [`Scheduler`] and runs the pass future for each,
//! guaranteeing that the same key is never reconciled twice concurrently and
//! that at most `degree` passes run at once. Keys that expire while their
//! pass is still running (or while all slots are busy) stay parked in the
//! scheduler and are taken as soon as capacity frees up.

use crate::scheduler::{ReconcileKey, ScheduleRequest, Scheduler};
use futures::{Future, FutureExt, Stream, StreamExt};
use pin_project::pin_project;
use std::{
    collections::HashMap,
    pin::Pin,
    task::{Context, Poll},
};

#[pin_project]
pub(crate) struct Runner<R, F, MkF> {
    #[pin]
    scheduler: Scheduler<R>,
    run_key: MkF,
    /// Active passes, keyed by the reconcile key they serve. Polled in
    /// arbitrary order; no fairness is attempted.
    slots: HashMap<ReconcileKey, F>,
    degree: usize,
}

impl<R, F, MkF> Runner<R, F, MkF>
where
    F: Future + Unpin,
    MkF: FnMut(&ReconcileKey) -> F,
{
    pub(crate) fn new(scheduler: Scheduler<R>, degree: usize, run_key: MkF) -> Self {
        Self {
            scheduler,
            run_key,
            slots: HashMap::new(),
            degree: degree.max(1),
        }
    }
}

impl<R, F, MkF> Stream for Runner<R, F, MkF>
where
    R: Stream<Item = ScheduleRequest>,
    F: Future + Unpin,
    MkF: FnMut(&ReconcileKey) -> F,
{
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // drive the active passes first
        let finished = this
            .slots
            .iter_mut()
            .find_map(|(key, fut)| match fut.poll_unpin(cx) {
                Poll::Ready(output) => Some((key.clone(), output)),
                Poll::Pending => None,
            });
        if let Some((key, output)) = finished {
            this.slots.remove(&key);
            return Poll::Ready(Some(output));
        }

        loop {
            if this.slots.len() >= *this.degree {
                // no capacity: keep draining schedule requests so producers
                // are not blocked, parking whatever expires
                return match this.scheduler.as_mut().hold().poll_next_unpin(cx) {
                    Poll::Ready(None) if this.slots.is_empty() => Poll::Ready(None),
                    _ => Poll::Pending,
                };
            }
            let slots = &*this.slots;
            let next = this
                .scheduler
                .as_mut()
                .hold_unless(|key| !slots.contains_key(key))
                .poll_next_unpin(cx);
            match next {
                Poll::Ready(Some(key)) => {
                    let fut = (this.run_key)(&key);
                    this.slots.insert(key, fut);
                    // freshly inserted futures have not registered a waker yet
                    cx.waker().wake_by_ref();
                }
                Poll::Ready(None) => {
                    return if this.slots.is_empty() {
                        Poll::Ready(None)
                    } else {
                        // scheduler is done but passes are still in flight
                        Poll::Pending
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
