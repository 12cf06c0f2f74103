//! Domain identifiers (strongly-typed IDs).
//!
//! - `OutboxId`: surrogate key of an outbox row. Monotonically increasing,
//!   so it doubles as the claim cursor and the FIFO tiebreak.
//! - `LeaseToken`: ULID handed out per claim. Time-sortable and generated
//!   without coordination, which is all a lease needs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Identifier of an outbox row.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(u64);

impl OutboxId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for OutboxId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for OutboxId {
    type Err = std::num::ParseIntError;

    /// Accepts both `42` and `outbox-42`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("outbox-").unwrap_or(s);
        digits.parse::<u64>().map(Self)
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbox-{}", self.0)
    }
}

/// Token identifying one claim of a batch of rows.
///
/// Every row claimed in the same `claim_batch` call carries the same token;
/// two claims never share one.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Ulid);

impl LeaseToken {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for LeaseToken {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl FromStr for LeaseToken {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("lease-").unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}
