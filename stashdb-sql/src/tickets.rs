//! Sequence-backed ticket generator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use stashdb_core::{Dialect, StashResult, StorageError, TicketGenerator, TICKET_BLOCK_SIZE};
use tokio::sync::Mutex;

use crate::error::{pool_error, query_error};

const REFILL_ATTEMPTS: u32 = 20;
const REFILL_PAUSE: Duration = Duration::from_millis(500);

/// Hands out ids from blocks reserved on a database sequence.
///
/// The sequence increments by the block size, so each `nextval` reserves a
/// whole block for this process and ids stay unique across processes.
pub struct PostgresTickets {
    pool: Pool,
    dialect: Dialect,
    block: Mutex<VecDeque<i64>>,
    ready: AtomicBool,
}

impl std::fmt::Debug for PostgresTickets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTickets")
            .field("dialect", &self.dialect)
            .finish_non_exhaustive()
    }
}

impl PostgresTickets {
    pub fn new(pool: Pool, dialect: Dialect) -> Self {
        Self {
            pool,
            dialect,
            block: Mutex::new(VecDeque::new()),
            ready: AtomicBool::new(false),
        }
    }

    async fn reserve_block(&self) -> StashResult<i64> {
        let conn = self.pool.get().await.map_err(pool_error)?;
        if !self.ready.load(Ordering::SeqCst) {
            conn.batch_execute(&self.dialect.ticket_setup_sql())
                .await
                .map_err(query_error)?;
            self.ready.store(true, Ordering::SeqCst);
        }
        let row = conn
            .query_one(self.dialect.next_ticket_block_sql().as_str(), &[])
            .await
            .map_err(query_error)?;
        row.try_get::<_, i64>(0).map_err(query_error)
    }

    async fn refill(&self, block: &mut VecDeque<i64>) -> StashResult<()> {
        for attempt in 1..=REFILL_ATTEMPTS {
            match self.reserve_block().await {
                Ok(start) => {
                    block.extend(start..start + TICKET_BLOCK_SIZE);
                    tracing::debug!(start, size = TICKET_BLOCK_SIZE, "Reserved ticket block");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Failed to load ticket block");
                    if attempt < REFILL_ATTEMPTS {
                        tokio::time::sleep(REFILL_PAUSE).await;
                    }
                }
            }
        }
        Err(StorageError::TicketsExhausted {
            attempts: REFILL_ATTEMPTS,
        }
        .into())
    }
}

#[async_trait]
impl TicketGenerator for PostgresTickets {
    async fn next_id(&self) -> StashResult<i64> {
        let mut block = self.block.lock().await;
        if block.is_empty() {
            self.refill(&mut block).await?;
        }
        block.pop_front().ok_or_else(|| {
            StorageError::TicketsExhausted {
                attempts: REFILL_ATTEMPTS,
            }
            .into()
        })
    }
}
