//! Outbox row status.

use serde::{Deserialize, Serialize};

/// Row status.
///
/// State transitions:
/// - Pending -> (claimed) -> Published
/// - Pending -> (claimed) -> Pending (retry, `available_at` pushed back)
/// - Pending -> (claimed) -> Dead (retries exhausted or permanent failure)
/// - Dead -> Pending (operator requeue only)
///
/// A lease is not a status: a claimed row stays `Pending` and carries lease
/// fields until its outcome is recorded or the lease expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be (re)delivered.
    Pending,

    /// Delivered. Terminal.
    Published,

    /// Dead-lettered. Terminal for the dispatcher.
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }

    /// Is this a terminal state for the dispatcher?
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Dead)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row counts by status.
///
/// `leased` is the subset of `pending` rows holding a lease that is still
/// valid at the time of the query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub leased: usize,
    pub published: usize,
    pub dead: usize,
}

impl OutboxCounts {
    pub fn total(&self) -> usize {
        self.pending + self.published + self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [OutboxStatus::Pending, OutboxStatus::Published, OutboxStatus::Dead] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("sent"), None);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(OutboxStatus::Published.is_terminal());
        assert!(OutboxStatus::Dead.is_terminal());
    }
}
