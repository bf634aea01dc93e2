//! Watch events emitted by the store

use fleet_core::Resource;

/// A change observed on a watched `(type, namespace)`.
///
/// Events carry both pre- and post-images where applicable so consumers can
/// diff without re-reading the store.
#[derive(Clone, Debug)]
pub enum Event {
    /// A resource came into existence. Also replayed for every live resource
    /// at the start of a subscription.
    Created(Resource),
    /// A resource was mutated (including entering the tearing-down phase).
    Updated {
        /// State before the mutation
        old: Resource,
        /// State after the mutation
        new: Resource,
    },
    /// A resource was removed, carrying its final state.
    Destroyed(Resource),
    /// Marker emitted once per subscription after the initial replay; live
    /// events follow.
    Bootstrapped,
}

impl Event {
    /// The most recent image carried by this event, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Resource> {
        match self {
            Event::Created(new) | Event::Updated { new, .. } => Some(new),
            Event::Destroyed(old) => Some(old),
            Event::Bootstrapped => None,
        }
    }
}
