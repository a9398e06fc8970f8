//! In-memory storage double plus schema fixtures shared by module tests
//! and downstream integration tests.

use crate::error::AppError;
use crate::partitioning::ShardBump;
use crate::schema::{EntityDef, IndexDef};
use crate::storage::{
    BatchGetResult, BatchWriteResult, IndexQueryPage, IndexQueryRequest, Item, ItemKey, StoreDriver,
};
use crate::transcode::{Scalar, TranscodeRegistry, BIGINT, STRING, TIMESTAMP};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Builds an item from literal entries.
pub fn item(entries: &[(&str, Scalar)]) -> Item {
    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Fixture entity: orders partitioned by customer, sorted by creation
/// time, with a narrow and a wide shard regime so range queries fan out
/// across both. The entity key defaults to the order id, spreading one
/// customer's orders over the shard space.
pub fn order_entity() -> EntityDef {
    EntityDef::new("order", "orders", "id")
        .with_hash_props(&["customer"])
        .with_range_props(&["created"])
        .with_bumps(&[ShardBump::new(0, 2, 1), ShardBump::new(2_000, 2, 2)])
        .with_index(IndexDef::new("byCreated", &["customer"], &["created"]))
        .with_index(IndexDef::new("byTotal", &["customer"], &["total"]))
        .with_transcode("id", STRING)
        .with_transcode("customer", STRING)
        .with_transcode("created", TIMESTAMP)
        .with_transcode("total", BIGINT)
        .with_timestamp(|i| match i.get("created") {
            Some(Scalar::Timestamp(t)) => Some(*t),
            _ => None,
        })
}

pub fn order_item(id: &str, customer: &str, created: i64, total: i64) -> Item {
    item(&[
        ("id", Scalar::String(id.to_string())),
        ("customer", Scalar::String(customer.to_string())),
        ("created", Scalar::Timestamp(created)),
        ("total", Scalar::BigInt(total as i128)),
        ("note", Scalar::String("gift".to_string())),
    ])
}

/// Key slot holding the primary record key in a stored record.
pub const PRIMARY: &str = "~primary";

/// One physically stored record: the item plus its materialized composite
/// keys, one slot per index and one for the primary record.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub keys: HashMap<String, (String, String)>,
    pub item: Item,
}

/// Builds the stored form of one item the way a writer would: shard key
/// from the item's own timestamp, then hash/sort composites per index.
pub fn record_for(
    entity: &EntityDef,
    registry: &TranscodeRegistry,
    item: &Item,
) -> Result<StoredRecord, AppError> {
    let shard = entity.shard_key(item)?;
    let mut keys = HashMap::new();
    keys.insert(
        PRIMARY.to_string(),
        (
            entity.physical_hash_key(registry, None, item, &shard)?,
            entity.sort_composite(registry, None, item)?,
        ),
    );
    for (token, index) in &entity.indexes {
        keys.insert(
            token.clone(),
            (
                entity.physical_hash_key(registry, Some(index), item, &shard)?,
                entity.sort_composite(registry, Some(index), item)?,
            ),
        );
    }
    Ok(StoredRecord { keys, item: item.clone() })
}

/// Loads order items into the store under the fixture schema.
pub fn seed(store: &MemoryStore, items: &[Item]) {
    let entity = order_entity();
    let registry = TranscodeRegistry::standard();
    for item in items {
        store.put_record(record_for(&entity, &registry, item).expect("seed item must encode"));
    }
}

type Indexer = Arc<dyn Fn(&Item) -> Result<StoredRecord, AppError> + Send + Sync>;

/// In-memory [`StoreDriver`] double. Implements the documented driver
/// contract over stored records (hash/range matching, pagination, scan
/// direction, projection) and records every index query it receives.
/// Filter expressions are backend semantics and are deliberately not
/// evaluated; assert on the captured requests instead. Failure knobs
/// simulate transport errors, throttled (unprocessed) batches and failing
/// shards.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
    captured: Mutex<Vec<IndexQueryRequest>>,
    failing_hash_keys: Mutex<HashSet<String>>,
    write_calls: AtomicUsize,
    write_errors_left: AtomicUsize,
    always_unprocessed: AtomicBool,
    get_unprocessed_rounds: AtomicUsize,
    indexer: Mutex<Option<Indexer>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes batched puts queryable by materializing keys with the order
    /// fixture schema.
    pub fn with_order_indexer(self) -> Self {
        let entity = order_entity();
        let registry = TranscodeRegistry::standard();
        *self.indexer.lock().unwrap() =
            Some(Arc::new(move |item: &Item| record_for(&entity, &registry, item)));
        self
    }

    pub fn put_record(&self, record: StoredRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn records_len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn captured_queries(&self) -> Vec<IndexQueryRequest> {
        self.captured.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Every index query against this physical hash key fails.
    pub fn fail_hash_key(&self, hash_key: &str) {
        self.failing_hash_keys.lock().unwrap().insert(hash_key.to_string());
    }

    /// The next `n` batch writes fail with a transport error.
    pub fn fail_next_writes(&self, n: usize) {
        self.write_errors_left.store(n, Ordering::SeqCst);
    }

    /// Every batch write reports all items unprocessed.
    pub fn set_always_unprocessed(&self, on: bool) {
        self.always_unprocessed.store(on, Ordering::SeqCst);
    }

    /// The next `n` batch gets report every key unprocessed.
    pub fn unprocessed_get_rounds(&self, n: usize) {
        self.get_unprocessed_rounds.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreDriver for MemoryStore {
    async fn run_index_query(&self, req: IndexQueryRequest) -> Result<IndexQueryPage, AppError> {
        if self.failing_hash_keys.lock().unwrap().contains(&req.hash_key) {
            return Err(AppError::Storage(format!("injected failure for '{}'", req.hash_key)));
        }
        self.captured.lock().unwrap().push(req.clone());

        let records = self.records.lock().unwrap();
        let mut hits: Vec<(String, Item)> = records
            .iter()
            .filter_map(|r| {
                let (hash, sort) = r.keys.get(&req.index)?;
                if hash != &req.hash_key {
                    return None;
                }
                if let Some(range) = &req.range {
                    if !range.matches(sort) {
                        return None;
                    }
                }
                Some((sort.clone(), r.item.clone()))
            })
            .collect();
        drop(records);

        hits.sort_by(|a, b| a.0.cmp(&b.0));
        if !req.scan_forward {
            hits.reverse();
        }
        if let Some(boundary) = &req.page_key {
            hits.retain(|(sort, _)| {
                if req.scan_forward {
                    sort.as_str() > boundary.as_str()
                } else {
                    sort.as_str() < boundary.as_str()
                }
            });
        }

        let more = hits.len() > req.page_size;
        let page: Vec<(String, Item)> = hits.into_iter().take(req.page_size).collect();
        let page_key = if more { page.last().map(|(sort, _)| sort.clone()) } else { None };
        let items = page
            .into_iter()
            .map(|(_, mut item)| {
                if let Some(projection) = &req.projection {
                    item.retain(|attr, _| projection.iter().any(|p| p == attr));
                }
                item
            })
            .collect();
        Ok(IndexQueryPage { items, page_key })
    }

    async fn run_batch_write(
        &self,
        _table: &str,
        puts: Vec<Item>,
        deletes: Vec<ItemKey>,
    ) -> Result<BatchWriteResult, AppError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.write_errors_left.load(Ordering::SeqCst) > 0 {
            self.write_errors_left.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Storage("injected write failure".to_string()));
        }
        if self.always_unprocessed.load(Ordering::SeqCst) {
            return Ok(BatchWriteResult { unprocessed_puts: puts, unprocessed_deletes: deletes });
        }

        let indexer = self.indexer.lock().unwrap().clone();
        let mut records = self.records.lock().unwrap();
        for put in puts {
            match &indexer {
                Some(index) => records.push(index(&put)?),
                None => records.push(StoredRecord { keys: HashMap::new(), item: put }),
            }
        }
        for key in deletes {
            // An absent record is a success: someone else deleted it first.
            records.retain(|r| {
                r.keys
                    .get(PRIMARY)
                    .map(|(hash, range)| hash != &key.hash || range != &key.range)
                    .unwrap_or(true)
            });
        }
        Ok(BatchWriteResult::default())
    }

    async fn run_batch_get(&self, _table: &str, keys: Vec<ItemKey>) -> Result<BatchGetResult, AppError> {
        if self.get_unprocessed_rounds.load(Ordering::SeqCst) > 0 {
            self.get_unprocessed_rounds.fetch_sub(1, Ordering::SeqCst);
            return Ok(BatchGetResult { items: Vec::new(), unprocessed_keys: keys });
        }
        let records = self.records.lock().unwrap();
        let items = keys
            .iter()
            .filter_map(|key| {
                records
                    .iter()
                    .find(|r| {
                        r.keys
                            .get(PRIMARY)
                            .map(|(hash, range)| hash == &key.hash && range == &key.range)
                            .unwrap_or(false)
                    })
                    .map(|r| r.item.clone())
            })
            .collect();
        Ok(BatchGetResult { items, unprocessed_keys: Vec::new() })
    }
}
