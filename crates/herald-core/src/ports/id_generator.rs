//! LeaseTokenGenerator port - lease token generation.
//!
//! # Implementations
//! - **UlidTokenGenerator**: ULID built from the clock's timestamp plus
//!   80 random bits. Unique without coordination between dispatchers.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::LeaseToken;
use crate::ports::Clock;

pub trait LeaseTokenGenerator: Send + Sync {
    fn next_token(&self) -> LeaseToken;
}

/// ULID based token generator.
///
/// Takes its timestamp from `Clock`, so under `FixedClock` all tokens share
/// the timestamp part and differ only in the random part.
pub struct UlidTokenGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidTokenGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl LeaseTokenGenerator for UlidTokenGenerator {
    fn next_token(&self) -> LeaseToken {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        LeaseToken::from_ulid(ulid)
    }
}
