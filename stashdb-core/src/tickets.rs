//! Surrogate id generation.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::StashResult;

/// Produces globally unique, increasing ids for new rows.
#[async_trait]
pub trait TicketGenerator: Send + Sync {
    async fn next_id(&self) -> StashResult<i64>;
}

/// Process-local counter. Suitable for tests and dry runs only.
#[derive(Debug)]
pub struct InMemoryTickets {
    next: AtomicI64,
}

impl InMemoryTickets {
    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for InMemoryTickets {
    fn default() -> Self {
        Self::starting_at(100_000)
    }
}

#[async_trait]
impl TicketGenerator for InMemoryTickets {
    async fn next_id(&self) -> StashResult<i64> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }
}
