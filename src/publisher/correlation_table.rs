use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::UserContext;
use crate::{CorrelationTag, Publishable};

/// One slot of the correlation table.
///
/// The two halves of an entry are written by different parties: the publish
/// call records the user context, the send path records the publishable once
/// the transport has taken it. Either may arrive first.
#[derive(Clone, Default)]
pub(crate) enum Correlation {
    // ---
    #[default]
    Empty,
    PublishableOnly(Publishable),
    UserContextOnly(UserContext),
    Complete(Publishable, UserContext),
}

impl Correlation {
    fn merge(self, publishable: Option<Publishable>, user_context: Option<UserContext>) -> Self {
        // ---
        let (p, c) = self.into_parts();
        Correlation::from_parts(publishable.or(p), user_context.or(c))
    }

    fn from_parts(publishable: Option<Publishable>, user_context: Option<UserContext>) -> Self {
        // ---
        match (publishable, user_context) {
            (None, None) => Correlation::Empty,
            (Some(p), None) => Correlation::PublishableOnly(p),
            (None, Some(c)) => Correlation::UserContextOnly(c),
            (Some(p), Some(c)) => Correlation::Complete(p, c),
        }
    }

    /// Split into `(publishable, user_context)`.
    pub fn into_parts(self) -> (Option<Publishable>, Option<UserContext>) {
        // ---
        match self {
            Correlation::Empty => (None, None),
            Correlation::PublishableOnly(p) => (Some(p), None),
            Correlation::UserContextOnly(c) => (None, Some(c)),
            Correlation::Complete(p, c) => (Some(p), Some(c)),
        }
    }

    pub fn has_publishable(&self) -> bool {
        matches!(
            self,
            Correlation::PublishableOnly(_) | Correlation::Complete(..)
        )
    }
}

/// Result of [`CorrelationTable::take_complete`].
pub(crate) enum Lookup {
    /// The entry had its publishable half and was removed.
    Ready(Correlation),
    /// The entry exists but is still waiting for the send path.
    Partial,
    /// No entry for this tag.
    Absent,
}

/// Maps fire-and-forget correlation tags to their partially or fully known
/// publish state.
///
/// Backed by a sharded map so the transport ack path, the send path and the
/// delivery dispatcher only contend on the shard holding their tag.
#[derive(Default)]
pub(crate) struct CorrelationTable {
    slots: DashMap<CorrelationTag, Correlation>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or complete the entry for `tag`.
    ///
    /// Halves passed as `None` leave the existing half untouched.
    pub fn record(
        &self,
        tag: CorrelationTag,
        publishable: Option<Publishable>,
        user_context: Option<UserContext>,
    ) {
        // ---
        match self.slots.entry(tag) {
            Entry::Occupied(mut slot) => {
                let merged = std::mem::take(slot.get_mut()).merge(publishable, user_context);
                *slot.get_mut() = merged;
            }
            Entry::Vacant(slot) => {
                slot.insert(Correlation::from_parts(publishable, user_context));
            }
        }
    }

    /// Set the publishable half of an existing entry.
    ///
    /// Returns `false` if there is no entry for `tag`.
    pub fn fill_publishable(&self, tag: &CorrelationTag, publishable: &Publishable) -> bool {
        // ---
        match self.slots.get_mut(tag) {
            Some(mut slot) => {
                let merged = std::mem::take(slot.value_mut()).merge(Some(publishable.clone()), None);
                *slot.value_mut() = merged;
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry for `tag`, whatever its state.
    pub fn take(&self, tag: &CorrelationTag) -> Option<Correlation> {
        self.slots.remove(tag).map(|(_, entry)| entry)
    }

    /// Remove and return the entry for `tag` only if its publishable half is
    /// known.
    pub fn take_complete(&self, tag: &CorrelationTag) -> Lookup {
        // ---
        match self.slots.entry(tag.clone()) {
            Entry::Occupied(slot) if slot.get().has_publishable() => Lookup::Ready(slot.remove()),
            Entry::Occupied(_) => Lookup::Partial,
            Entry::Vacant(_) => Lookup::Absent,
        }
    }

    /// `true` if the entry for `tag` exists and knows its publishable.
    pub fn has_publishable(&self, tag: &CorrelationTag) -> bool {
        self.slots
            .get(tag)
            .is_some_and(|slot| slot.value().has_publishable())
    }

    pub fn contains(&self, tag: &CorrelationTag) -> bool {
        self.slots.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;

    use super::*;
    use crate::correlation::TagGenerator;
    use crate::{CorrelationClass, OutboundMessage, Topic};

    fn publishable() -> Publishable {
        Publishable::new(OutboundMessage::from("m"), Topic::of("t").unwrap())
    }

    fn context(value: u32) -> UserContext {
        Arc::new(value)
    }

    #[test]
    fn test_context_first_then_publishable_merges() {
        // ---
        let table = CorrelationTable::new();
        let tag = TagGenerator::new().next(CorrelationClass::FireAndForget);

        table.record(tag.clone(), None, Some(context(7)));
        assert!(matches!(table.take_complete(&tag), Lookup::Partial));
        assert!(table.contains(&tag));
        assert!(!table.has_publishable(&tag));

        table.record(tag.clone(), Some(publishable()), None);
        let Lookup::Ready(entry) = table.take_complete(&tag) else {
            panic!("entry should be complete");
        };
        let (p, c) = entry.into_parts();
        assert!(p.is_some());
        assert_eq!(c.unwrap().downcast_ref::<u32>(), Some(&7));
        assert!(table.is_empty());
    }

    #[test]
    fn test_publishable_first_is_complete_enough() {
        // ---
        let table = CorrelationTable::new();
        let tag = TagGenerator::new().next(CorrelationClass::FireAndForget);

        table.record(tag.clone(), Some(publishable()), None);
        assert!(matches!(
            table.take_complete(&tag),
            Lookup::Ready(Correlation::PublishableOnly(_))
        ));
    }

    #[test]
    fn test_take_unknown_is_absent() {
        // ---
        let table = CorrelationTable::new();
        let tag = TagGenerator::new().next(CorrelationClass::FireAndForget);

        assert!(table.take(&tag).is_none());
        assert!(matches!(table.take_complete(&tag), Lookup::Absent));

        table.record(tag.clone(), None, None);
        assert!(matches!(table.take(&tag), Some(Correlation::Empty)));
        assert!(table.take(&tag).is_none());
    }
}
