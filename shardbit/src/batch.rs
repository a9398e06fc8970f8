use crate::error::AppError;
use crate::query::{QueryEngine, QueryOptions};
use crate::retry::{retry_with_backoff, Submission};
use crate::settings::BatchSettings;
use crate::storage::{Item, ItemKey, StoreDriver};
use crate::warn;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};

/// Aggregated result of a batched write. Partial failures are data, not
/// errors: whatever stayed unprocessed after retry exhaustion comes back
/// here for the caller to re-submit or drop.
#[derive(Debug, Default)]
pub struct BatchWriteOutcome {
    pub put_count: usize,
    pub delete_count: usize,
    pub unprocessed_puts: Vec<Item>,
    pub unprocessed_deletes: Vec<ItemKey>,
    /// Most submissions any single chunk needed.
    pub attempts: usize,
    pub last_error: Option<String>,
}

impl BatchWriteOutcome {
    pub fn fully_processed(&self) -> bool {
        self.unprocessed_puts.is_empty() && self.unprocessed_deletes.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BatchGetOutcome {
    pub items: Vec<Item>,
    pub unprocessed_keys: Vec<ItemKey>,
    pub attempts: usize,
    pub last_error: Option<String>,
}

impl BatchGetOutcome {
    pub fn fully_processed(&self) -> bool {
        self.unprocessed_keys.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PurgeOutcome {
    pub deleted: usize,
    pub pages: usize,
    pub unprocessed: Vec<ItemKey>,
}

type WriteChunk = (Vec<Item>, Vec<ItemKey>);

/// Executes arbitrarily large put/delete/get request lists in
/// backend-sized batches: at most `throttle` batches in flight, unprocessed
/// leftovers retried with exponential backoff, partial failures aggregated
/// instead of thrown.
pub struct BatchClient {
    driver: Arc<dyn StoreDriver>,
    settings: BatchSettings,
}

impl BatchClient {
    pub fn new(driver: Arc<dyn StoreDriver>, settings: BatchSettings) -> Self {
        Self { driver, settings }
    }

    /// Writes `puts` and `deletes` to `table`. Chunks preserve input order;
    /// chunk submissions run concurrently under the throttle.
    pub async fn write(
        &self,
        table: &str,
        puts: Vec<Item>,
        deletes: Vec<ItemKey>,
    ) -> Result<BatchWriteOutcome, AppError> {
        let mut outcome = BatchWriteOutcome {
            put_count: puts.len(),
            delete_count: deletes.len(),
            ..BatchWriteOutcome::default()
        };
        let chunks = chunk_writes(puts, deletes, self.settings.batch_size.max(1));
        if chunks.is_empty() {
            return Ok(outcome);
        }

        let driver = self.driver.clone();
        let max_retries = self.settings.max_retries;
        let delay = self.settings.delay_increment;
        let results: Vec<_> = stream::iter(chunks.into_iter().map(|chunk| {
            let driver = driver.clone();
            let table = table.to_string();
            async move {
                retry_with_backoff(max_retries, delay, chunk, move |(puts, deletes)| {
                    let driver = driver.clone();
                    let table = table.clone();
                    async move {
                        let result = driver.run_batch_write(&table, puts, deletes).await?;
                        if result.unprocessed_puts.is_empty() && result.unprocessed_deletes.is_empty() {
                            Ok::<_, AppError>(Submission::Consumed)
                        } else {
                            Ok(Submission::Unprocessed((
                                result.unprocessed_puts,
                                result.unprocessed_deletes,
                            )))
                        }
                    }
                })
                .await
            }
        }))
        .buffer_unordered(self.settings.throttle.concurrency())
        .collect()
        .await;

        for result in results {
            outcome.attempts = outcome.attempts.max(result.attempts);
            if let Some(e) = result.last_error {
                outcome.last_error = Some(e.to_string());
            }
            if let Some((puts, deletes)) = result.leftover {
                outcome.unprocessed_puts.extend(puts);
                outcome.unprocessed_deletes.extend(deletes);
            }
        }
        if !outcome.fully_processed() {
            warn!(
                "batch write to '{}' left {} puts / {} deletes unprocessed after {} attempts: {}",
                table,
                outcome.unprocessed_puts.len(),
                outcome.unprocessed_deletes.len(),
                outcome.attempts,
                serde_json::to_string(&outcome.unprocessed_deletes).unwrap_or_default()
            );
        }
        Ok(outcome)
    }

    /// Reads `keys` from `table` in batches, retrying unprocessed keys.
    /// Items collected across attempts accumulate into one result.
    pub async fn get(&self, table: &str, keys: Vec<ItemKey>) -> Result<BatchGetOutcome, AppError> {
        let mut outcome = BatchGetOutcome::default();
        if keys.is_empty() {
            return Ok(outcome);
        }
        let batch_size = self.settings.batch_size.max(1);
        let chunks: Vec<Vec<ItemKey>> = keys.chunks(batch_size).map(|c| c.to_vec()).collect();

        let driver = self.driver.clone();
        let max_retries = self.settings.max_retries;
        let delay = self.settings.delay_increment;
        let collected: Arc<Mutex<Vec<Item>>> = Arc::new(Mutex::new(Vec::new()));
        let results: Vec<_> = stream::iter(chunks.into_iter().map(|chunk| {
            let driver = driver.clone();
            let table = table.to_string();
            let collected = collected.clone();
            async move {
                retry_with_backoff(max_retries, delay, chunk, move |keys| {
                    let driver = driver.clone();
                    let table = table.clone();
                    let collected = collected.clone();
                    async move {
                        let result = driver.run_batch_get(&table, keys).await?;
                        collected.lock()?.extend(result.items);
                        if result.unprocessed_keys.is_empty() {
                            Ok::<_, AppError>(Submission::Consumed)
                        } else {
                            Ok(Submission::Unprocessed(result.unprocessed_keys))
                        }
                    }
                })
                .await
            }
        }))
        .buffer_unordered(self.settings.throttle.concurrency())
        .collect()
        .await;

        for result in results {
            outcome.attempts = outcome.attempts.max(result.attempts);
            if let Some(e) = result.last_error {
                outcome.last_error = Some(e.to_string());
            }
            if let Some(keys) = result.leftover {
                outcome.unprocessed_keys.extend(keys);
            }
        }
        outcome.items = std::mem::take(&mut *collected.lock().map_err(AppError::from)?);
        Ok(outcome)
    }

    /// Deletes everything a query can reach: read a page, batch-delete its
    /// keys, resume from the page key, repeat. An item that vanished
    /// between read and delete counts as deleted (concurrent writers are
    /// expected); keys still unprocessed after retries are reported back.
    pub async fn purge(
        &self,
        engine: &QueryEngine,
        entity_token: &str,
        options: QueryOptions,
    ) -> Result<PurgeOutcome, AppError> {
        let entity = engine.schemas().entity(entity_token)?;
        let registry = engine.schemas().transcodes().clone();
        let mut outcome = PurgeOutcome::default();
        let mut page_key = options.page_key.clone();
        loop {
            let query = engine.shard_query(entity_token)?;
            let page = query.query(options.clone().with_page_key(page_key.take())).await?;
            outcome.pages += 1;
            if !page.items.is_empty() {
                let mut keys = Vec::with_capacity(page.items.len());
                for item in &page.items {
                    keys.push(entity.item_key(&registry, item)?);
                }
                let requested = keys.len();
                let written = self.write(&entity.table, Vec::new(), keys).await?;
                outcome.deleted += requested - written.unprocessed_deletes.len();
                outcome.unprocessed.extend(written.unprocessed_deletes);
            }
            match page.page_key {
                Some(next) => page_key = Some(next),
                None => break,
            }
        }
        Ok(outcome)
    }
}

/// Splits mixed put/delete work into chunks of at most `batch_size`
/// operations, puts first, preserving order within each kind.
fn chunk_writes(puts: Vec<Item>, deletes: Vec<ItemKey>, batch_size: usize) -> Vec<WriteChunk> {
    let mut chunks = Vec::new();
    let mut current: WriteChunk = (Vec::new(), Vec::new());
    let mut filled = 0usize;
    for put in puts {
        if filled == batch_size {
            chunks.push(std::mem::take(&mut current));
            filled = 0;
        }
        current.0.push(put);
        filled += 1;
    }
    for delete in deletes {
        if filled == batch_size {
            chunks.push(std::mem::take(&mut current));
            filled = 0;
        }
        current.1.push(delete);
        filled += 1;
    }
    if filled > 0 {
        chunks.push(current);
    }
    chunks
}
