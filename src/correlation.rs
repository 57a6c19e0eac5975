use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// Correlation class of an in-flight publish.
///
/// Fire-and-forget tags are tracked in the publisher's correlation table and
/// resolved into receipts. Await tags are matched directly against the wait
/// slot of the caller blocked in `publish_await_acknowledgement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationClass {
    // ---
    FireAndForget,
    Await,
}

impl CorrelationClass {
    fn as_char(self) -> char {
        // ---
        match self {
            CorrelationClass::FireAndForget => 'a',
            CorrelationClass::Await => 'w',
        }
    }
}

/// Identifier linking one outbound publish attempt to its acknowledgement.
///
/// A tag encodes the publisher that issued it, a per-publisher sequence
/// number and the correlation class. Tags are opaque to the transport, which
/// only needs [`publisher_id`](Self::publisher_id) to route the
/// acknowledgement back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationTag {
    publisher_id: Arc<str>,
    class: CorrelationClass,
    sequence: u64,
}

impl CorrelationTag {
    /// Build a tag from its parts.
    ///
    /// Publishers allocate their own tags; this is for transports and tests
    /// that need to fabricate one.
    pub fn new(publisher_id: impl Into<Arc<str>>, class: CorrelationClass, sequence: u64) -> Self {
        // ---
        Self {
            publisher_id: publisher_id.into(),
            class,
            sequence,
        }
    }

    /// Identity of the publisher that allocated this tag.
    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    pub fn class(&self) -> CorrelationClass {
        self.class
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.class == CorrelationClass::FireAndForget
    }

    pub fn is_await(&self) -> bool {
        self.class == CorrelationClass::Await
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.publisher_id,
            self.class.as_char(),
            self.sequence
        )
    }
}

/// Per-publisher tag allocator.
///
/// Sequence numbers are shared by both classes and never reused for the
/// lifetime of the publisher.
#[derive(Debug)]
pub(crate) struct TagGenerator {
    publisher_id: Arc<str>,
    next: AtomicU64,
}

impl TagGenerator {
    /// Create a generator with a fresh, globally unique publisher identity.
    pub fn new() -> Self {
        // ---
        Self::with_publisher_id(Uuid::new_v4().simple().to_string())
    }

    pub fn with_publisher_id(publisher_id: impl Into<Arc<str>>) -> Self {
        // ---
        Self {
            publisher_id: publisher_id.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    pub fn next(&self, class: CorrelationClass) -> CorrelationTag {
        // ---
        CorrelationTag {
            publisher_id: self.publisher_id.clone(),
            class,
            sequence: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_tags_are_unique_and_monotonic() {
        // ---
        let tags = TagGenerator::new();
        let a = tags.next(CorrelationClass::FireAndForget);
        let b = tags.next(CorrelationClass::Await);
        let c = tags.next(CorrelationClass::FireAndForget);

        assert_ne!(a, c);
        assert!(a.sequence() < b.sequence());
        assert!(b.sequence() < c.sequence());
        assert_eq!(a.publisher_id(), c.publisher_id());
    }

    #[test]
    fn test_class_discriminator() {
        // ---
        let tags = TagGenerator::with_publisher_id("pub-1");
        let a = tags.next(CorrelationClass::FireAndForget);
        let w = tags.next(CorrelationClass::Await);

        assert!(a.is_fire_and_forget() && !a.is_await());
        assert!(w.is_await() && !w.is_fire_and_forget());
        assert_eq!(a.to_string(), "pub-1/a/0");
        assert_eq!(w.to_string(), "pub-1/w/1");
    }

    #[test]
    fn test_publishers_get_distinct_ids() {
        // ---
        let p1 = TagGenerator::new();
        let p2 = TagGenerator::new();
        assert_ne!(p1.publisher_id(), p2.publisher_id());
    }
}
