//! Leadership-tag gate on the outbound delivery path.

use soloist_core::{LeadershipId, TaggedPublication};

/// Drops publications whose leadership tag differs from the one a
/// subscription was opened under.
///
/// During leadership turnover, publications tagged by the old leader may still
/// be in flight while subscriptions opened under the new leadership already
/// exist. Comparing tags at delivery time absorbs that window without
/// disconnecting the client; the drop is silent by design.
#[derive(Clone, Debug)]
pub struct DeliveryFilter {
    expected: LeadershipId,
}

impl DeliveryFilter {
    /// A filter admitting only publications tagged with `expected`.
    #[must_use]
    pub fn new(expected: LeadershipId) -> Self {
        Self { expected }
    }

    /// The leadership id this filter admits.
    #[must_use]
    pub fn expected(&self) -> &LeadershipId {
        &self.expected
    }

    /// `true` iff the publication belongs to the leadership this filter's
    /// subscription was opened under.
    pub fn admits(&self, publication: &TaggedPublication) -> bool {
        if publication.leadership == self.expected {
            true
        } else {
            tracing::debug!(
                channel = %publication.channel,
                tagged = %publication.leadership,
                expected = %self.expected,
                "dropping publication tagged by a different leadership"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use soloist_core::{Channel, LeadershipId, TaggedPublication};

    use super::DeliveryFilter;

    fn publication(tag: &str) -> TaggedPublication {
        TaggedPublication::event(
            Channel::new("ch").unwrap(),
            LeadershipId::new(tag),
            "payload".as_bytes().to_vec(),
        )
    }

    #[test]
    fn admits_matching_tags() {
        let filter = DeliveryFilter::new(LeadershipId::new("term-1"));
        assert!(filter.admits(&publication("term-1")));
    }

    #[test]
    fn drops_mismatched_tags() {
        let filter = DeliveryFilter::new(LeadershipId::new("term-2"));
        assert!(!filter.admits(&publication("term-1")));
    }
}
