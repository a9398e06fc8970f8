use crate::condition::{compile, Bindings, Condition};
use crate::error::AppError;
use crate::key_codec::{encode_pairs, PageKey};
use crate::partitioning;
use crate::schema::{EntityDef, IndexDef, SchemaRegistry};
use crate::settings::QuerySettings;
use crate::storage::{
    FilterExpression, IndexQueryPage, IndexQueryRequest, Item, RangeCondition, RangeOp, StoreDriver,
};
use crate::transcode::{Scalar, TranscodeRegistry, STRING};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// When in time the queried data may have been written; drives shard fan-out.
#[derive(Clone, Copy, Debug)]
pub enum TimeSpec {
    /// Fan out across every regime active in `[from, to]`.
    Range { from: i64, to: i64 },
    /// Pin one instant: only the single shard of that instant's regime is
    /// queried. The entity key must be derivable from the supplied hash
    /// values for this to work.
    At(i64),
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub index: String,
    /// Values for the index's hash-key properties.
    pub hash: Item,
    pub time: TimeSpec,
    /// Max items in the merged page; defaults to the effective page size.
    pub limit: Option<usize>,
    /// Physical per-shard page size.
    pub page_size: Option<usize>,
    pub page_key: Option<PageKey>,
    pub scan_forward: bool,
}

impl QueryOptions {
    pub fn new(index: &str, hash: Item, time: TimeSpec) -> Self {
        Self {
            index: index.to_string(),
            hash,
            time,
            limit: None,
            page_size: None,
            page_key: None,
            scan_forward: true,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_page_key(mut self, page_key: Option<PageKey>) -> Self {
        self.page_key = page_key;
        self
    }

    pub fn backwards(mut self) -> Self {
        self.scan_forward = false;
        self
    }
}

/// Accumulated expression state for one index: compiled filter fragments
/// with their bindings, the physical range condition, and presentation
/// options. Created fresh per builder, consumed when the physical requests
/// are generated.
#[derive(Clone, Default)]
pub struct IndexParams {
    filters: Vec<String>,
    bindings: Bindings,
    range: Option<RangeCondition>,
    scan_forward: Option<bool>,
    projection: Option<Vec<String>>,
}

impl IndexParams {
    fn filter_expression(&self) -> Option<FilterExpression> {
        if self.filters.is_empty() {
            return None;
        }
        Some(FilterExpression {
            expression: self.filters.join(" AND "),
            names: self.bindings.names.clone(),
            values: self.bindings.values.clone(),
        })
    }
}

/// One merged, globally sorted page.
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub items: Vec<Item>,
    pub count: usize,
    pub page_key: Option<PageKey>,
    /// Projection actually sent to the collaborator, `None` for full records.
    pub projection: Option<Vec<String>>,
}

/// Entry point: hands out per-entity query builders over one driver and
/// one immutable schema registry.
#[derive(Clone)]
pub struct QueryEngine {
    schemas: Arc<SchemaRegistry>,
    driver: Arc<dyn StoreDriver>,
    settings: QuerySettings,
}

impl QueryEngine {
    pub fn new(schemas: Arc<SchemaRegistry>, driver: Arc<dyn StoreDriver>, settings: QuerySettings) -> Self {
        Self { schemas, driver, settings }
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn driver(&self) -> &Arc<dyn StoreDriver> {
        &self.driver
    }

    /// A fresh builder for one logical query against `entity_token`.
    pub fn shard_query(&self, entity_token: &str) -> Result<ShardQuery, AppError> {
        Ok(ShardQuery {
            entity: self.schemas.entity(entity_token)?,
            schemas: self.schemas.clone(),
            driver: self.driver.clone(),
            settings: self.settings.clone(),
            params: HashMap::new(),
        })
    }
}

/// Query builder and fan-out executor for one entity. Accumulates
/// per-index [`IndexParams`], then `query` expands one logical query into
/// one physical query per shard and merges the results.
pub struct ShardQuery {
    entity: Arc<EntityDef>,
    schemas: Arc<SchemaRegistry>,
    driver: Arc<dyn StoreDriver>,
    settings: QuerySettings,
    params: HashMap<String, IndexParams>,
}

impl ShardQuery {
    /// Sets the range-key predicate for `index_token`: exactly one of a
    /// scalar comparison, `Between` or `BeginsWith`, targeting the index's
    /// declared range-key property.
    pub fn add_range_key_condition(&mut self, index_token: &str, cond: Condition) -> Result<(), AppError> {
        let index = self.entity.index(index_token)?.clone();
        let range_prop = index.range_props.first().cloned().ok_or_else(|| {
            AppError::InvalidCondition(format!("index '{}' has no range key", index.token))
        })?;
        if !cond.is_range_form() {
            return Err(AppError::InvalidCondition(
                "range key conditions accept comparisons, between and begins_with only".to_string(),
            ));
        }
        match cond.property() {
            Some(p) if p == range_prop => {}
            other => {
                return Err(AppError::InvalidCondition(format!(
                    "range key condition targets '{}' but index '{}' sorts by '{}'",
                    other.unwrap_or("<none>"),
                    index.token,
                    range_prop
                )));
            }
        }
        let compiled = self.build_range_condition(&index, &range_prop, &cond)?;
        let params = self.params.entry(index_token.to_string()).or_default();
        if params.range.is_some() {
            return Err(AppError::InvalidCondition(format!(
                "index '{}' already has a range key condition",
                index.token
            )));
        }
        params.range = Some(compiled);
        Ok(())
    }

    /// Appends a filter predicate for `index_token`. The full condition
    /// grammar is allowed here, including nested `And`/`Or`/`Not`. Each
    /// literal is bound to a fresh placeholder.
    pub fn add_filter_condition(&mut self, index_token: &str, cond: Condition) -> Result<(), AppError> {
        self.entity.index(index_token)?;
        let params = self.params.entry(index_token.to_string()).or_default();
        let fragment = compile(&cond, &mut params.bindings)?;
        params.filters.push(fragment);
        Ok(())
    }

    /// Overrides the scan direction for one index.
    pub fn set_scan_forward(&mut self, index_token: &str, forward: bool) -> Result<(), AppError> {
        self.entity.index(index_token)?;
        self.params.entry(index_token.to_string()).or_default().scan_forward = Some(forward);
        Ok(())
    }

    /// Restricts returned attributes for one index. The unique id and sort
    /// properties are re-added at query time regardless of this list.
    pub fn set_projection(&mut self, index_token: &str, attrs: &[&str]) -> Result<(), AppError> {
        let index = self.entity.index(index_token)?;
        if let Some(allowed) = &index.projection {
            for attr in attrs {
                if !allowed.iter().any(|a| a == attr) {
                    return Err(AppError::Config(format!(
                        "index '{}' does not project attribute '{}'",
                        index.token, attr
                    )));
                }
            }
        }
        self.params.entry(index_token.to_string()).or_default().projection =
            Some(attrs.iter().map(|a| a.to_string()).collect());
        Ok(())
    }

    /// Applies one projection list to every index of the entity.
    pub fn set_projection_all(&mut self, attrs: &[&str]) -> Result<(), AppError> {
        let tokens: Vec<String> = self.entity.indexes.keys().cloned().collect();
        for token in tokens {
            self.set_projection(&token, attrs)?;
        }
        Ok(())
    }

    /// Clears the projection for one index: full records again.
    pub fn reset_projection(&mut self, index_token: &str) -> Result<(), AppError> {
        self.entity.index(index_token)?;
        self.params.entry(index_token.to_string()).or_default().projection = None;
        Ok(())
    }

    /// Translates a logical range condition into the physical operator set
    /// over the range composite. Equality becomes a prefix match when more
    /// sort components follow; inclusive upper bounds get a sentinel one
    /// past the pair delimiter so equal-valued composites stay inside.
    fn build_range_condition(
        &self,
        index: &IndexDef,
        range_prop: &str,
        cond: &Condition,
    ) -> Result<RangeCondition, AppError> {
        let registry = self.schemas.transcodes();
        let delims = &self.entity.delims;
        let transcode = self.entity.transcode_of(range_prop)?.to_string();
        let continues = self.entity.sort_props(Some(index)).len() > 1;
        let pair_delim = delims.pair;

        let prefix = |value: &Scalar| -> Result<String, AppError> {
            let encoded = registry.encode(&transcode, range_prop, value)?;
            Ok(encode_pairs(&[(range_prop.to_string(), encoded)], delims))
        };
        let upper = |p: &str| upper_bound(p, pair_delim);

        let compiled = match cond {
            Condition::Eq(_, v) => {
                let p = prefix(v)?;
                if continues {
                    RangeCondition::new(RangeOp::BeginsWith, vec![format!("{}{}", p, pair_delim)])
                } else {
                    RangeCondition::new(RangeOp::Eq, vec![p])
                }
            }
            Condition::Ne(_, v) => {
                let p = prefix(v)?;
                if continues {
                    RangeCondition::new(RangeOp::NotBeginsWith, vec![format!("{}{}", p, pair_delim)])
                } else {
                    RangeCondition::new(RangeOp::Ne, vec![p])
                }
            }
            Condition::Lt(_, v) => RangeCondition::new(RangeOp::Lt, vec![prefix(v)?]),
            Condition::Ge(_, v) => RangeCondition::new(RangeOp::Ge, vec![prefix(v)?]),
            Condition::Le(_, v) => RangeCondition::new(RangeOp::Lt, vec![upper(&prefix(v)?)]),
            Condition::Gt(_, v) => RangeCondition::new(RangeOp::Ge, vec![upper(&prefix(v)?)]),
            Condition::Between(_, lo, hi) => {
                RangeCondition::new(RangeOp::Between, vec![prefix(lo)?, upper(&prefix(hi)?)])
            }
            Condition::BeginsWith(_, s) => {
                if transcode != STRING {
                    return Err(AppError::InvalidCondition(format!(
                        "begins_with requires a string-transcoded property, '{}' is {}",
                        range_prop, transcode
                    )));
                }
                let p = encode_pairs(&[(range_prop.to_string(), s.clone())], delims);
                RangeCondition::new(RangeOp::BeginsWith, vec![p])
            }
            other => {
                return Err(AppError::InvalidCondition(format!(
                    "condition {:?} is not a range key form",
                    other
                )));
            }
        };
        Ok(compiled)
    }

    /// Runs the logical query: resolves the shard-key space, issues one
    /// physical query per shard under the fan-out throttle, and merges the
    /// per-shard streams into one globally sorted, deduplicated page.
    ///
    /// Consumes the builder; per-query state never outlives its invocation.
    /// Dropping the returned future cancels outstanding shard requests and
    /// discards partial merge state.
    pub async fn query(mut self, opts: QueryOptions) -> Result<QueryResult, AppError> {
        let entity = self.entity.clone();
        let index = entity.index(&opts.index)?.clone();
        let params = self.params.remove(&opts.index).unwrap_or_default();
        let registry = self.schemas.transcodes().clone();

        let scan_forward = params.scan_forward.unwrap_or(opts.scan_forward);
        let sort_props = entity.sort_props(Some(&index));
        let projection = effective_projection(params.projection.clone(), &sort_props);
        let page_size = opts
            .page_size
            .or(index.page_size)
            .unwrap_or(self.settings.default_page_size)
            .max(1);
        let limit = opts.limit.unwrap_or(page_size).max(1);
        let boundary = match &opts.page_key {
            Some(pk) => Some(boundary_composite(&entity, &sort_props, pk)?),
            None => None,
        };

        let shards = match opts.time {
            TimeSpec::Range { from, to } => entity.shard_key_space(from, to)?,
            TimeSpec::At(ts) => {
                let key = (entity.entity_key)(&opts.hash).ok_or_else(|| {
                    AppError::new(format!(
                        "entity '{}': entity key not derivable from query hash values",
                        entity.token
                    ))
                })?;
                vec![partitioning::shard_key(&key, &partitioning::find_bump(&entity.bumps, ts))]
            }
        };

        let filter = params.filter_expression();
        let range = params.range.clone();
        let make_request = |shard: &Option<String>, page_key: Option<String>| -> Result<IndexQueryRequest, AppError> {
            Ok(IndexQueryRequest {
                table: entity.table.clone(),
                index: index.token.clone(),
                hash_key: entity.physical_hash_key(&registry, Some(&index), &opts.hash, shard)?,
                range: range.clone(),
                filter: filter.clone(),
                projection: projection.clone(),
                page_key,
                page_size,
                scan_forward,
            })
        };

        // Encoding problems surface here, before any request is in flight.
        let mut prepared = Vec::with_capacity(shards.len());
        for shard in shards {
            let request = make_request(&shard, boundary.clone())?;
            prepared.push((shard, request));
        }

        let throttle = self.settings.throttle.concurrency();
        let driver = self.driver.clone();
        let mut cursors: Vec<ShardCursor> = Vec::with_capacity(prepared.len());
        {
            let mut fetches = stream::iter(prepared.into_iter().map(|(shard, request)| {
                let driver = driver.clone();
                async move {
                    let page = driver.run_index_query(request).await;
                    (shard, page)
                }
            }))
            .buffer_unordered(throttle.max(1));

            while let Some((shard, result)) = fetches.next().await {
                match result {
                    Ok(page) => {
                        cursors.push(ShardCursor::new(shard, page, &entity, &index, &registry)?)
                    }
                    Err(source) => {
                        let contributed = cursors.iter().map(|c| c.tag.clone()).collect();
                        return Err(AppError::QueryAborted {
                            entity: entity.token.clone(),
                            index: index.token.clone(),
                            shard: shard.unwrap_or_default(),
                            contributed,
                            source: Box::new(source),
                        });
                    }
                }
            }
        }

        // Deterministic tie-break on equal sort composites.
        cursors.sort_by(|a, b| a.tag.cmp(&b.tag));

        let mut items: Vec<Item> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut last_emitted: Option<(Option<String>, Item)> = None;

        loop {
            if items.len() >= limit {
                break;
            }
            // Top up drained cursors that still have pages behind them. A
            // backend may return an empty page with a continuation, so loop
            // until items arrive or the shard is truly exhausted.
            let mut failed: Option<(String, AppError)> = None;
            for cursor in cursors.iter_mut() {
                while cursor.buffer.is_empty() && cursor.next_page.is_some() {
                    let page_key = cursor.next_page.take();
                    let request = make_request(&cursor.shard, page_key)?;
                    match driver.run_index_query(request).await {
                        Ok(page) => cursor.absorb(page, &entity, &index, &registry)?,
                        Err(source) => {
                            failed = Some((cursor.tag.clone(), source));
                            break;
                        }
                    }
                }
                if failed.is_some() {
                    break;
                }
            }
            if let Some((failed_tag, source)) = failed {
                let contributed = cursors
                    .iter()
                    .map(|c| c.tag.clone())
                    .filter(|t| t != &failed_tag)
                    .collect();
                return Err(AppError::QueryAborted {
                    entity: entity.token.clone(),
                    index: index.token.clone(),
                    shard: failed_tag,
                    contributed,
                    source: Box::new(source),
                });
            }

            let Some(winner) = pick_winner(&cursors, scan_forward) else {
                break;
            };
            let (_, item) = cursors[winner].buffer.pop_front().expect("winner has a head");
            let id_encoded = entity.encode_prop(&registry, &item, &entity.id_prop)?;
            if seen_ids.insert(id_encoded) {
                last_emitted = Some((cursors[winner].shard.clone(), item.clone()));
                items.push(item);
            }
        }

        let more = cursors.iter().any(|c| !c.buffer.is_empty() || c.next_page.is_some());
        let page_key = match (&last_emitted, items.len() >= limit && more) {
            (Some((shard, item)), true) => {
                let mut components = Vec::with_capacity(sort_props.len());
                for prop in &sort_props {
                    components.push((prop.clone(), entity.encode_prop(&registry, item, prop)?));
                }
                Some(PageKey { shard: shard.clone(), components })
            }
            _ => None,
        };

        let count = items.len();
        Ok(QueryResult { items, count, page_key, projection })
    }
}

/// The caller's projection with the unique id and sort-order properties
/// unconditionally re-added; dropping them would break dedup and
/// progressive sort across merged shard pages.
fn effective_projection(
    requested: Option<Vec<String>>,
    sort_props: &[String],
) -> Option<Vec<String>> {
    requested.map(|mut attrs| {
        for prop in sort_props {
            if !attrs.iter().any(|a| a == prop) {
                attrs.push(prop.clone());
            }
        }
        attrs
    })
}

/// Rebuilds the physical boundary composite from a decoded page key,
/// validating that every sort component is present.
fn boundary_composite(
    entity: &EntityDef,
    sort_props: &[String],
    page_key: &PageKey,
) -> Result<String, AppError> {
    let mut pairs = Vec::with_capacity(sort_props.len());
    for prop in sort_props {
        let value = page_key
            .components
            .iter()
            .find(|(p, _)| p == prop)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| AppError::MalformedKey(format!("page key lacks component '{}'", prop)))?;
        pairs.push((prop.clone(), value));
    }
    Ok(encode_pairs(&pairs, &entity.delims))
}

/// Smallest string strictly above every extension of `prefix` by the pair
/// delimiter, used to close inclusive upper bounds.
fn upper_bound(prefix: &str, pair_delim: char) -> String {
    let sentinel = char::from_u32(pair_delim as u32 + 1).unwrap_or(char::MAX);
    format!("{}{}", prefix, sentinel)
}

struct ShardCursor {
    shard: Option<String>,
    tag: String,
    buffer: VecDeque<(String, Item)>,
    next_page: Option<String>,
}

impl ShardCursor {
    fn new(
        shard: Option<String>,
        page: IndexQueryPage,
        entity: &EntityDef,
        index: &IndexDef,
        registry: &TranscodeRegistry,
    ) -> Result<Self, AppError> {
        let tag = shard.clone().unwrap_or_default();
        let mut cursor = Self { shard, tag, buffer: VecDeque::new(), next_page: None };
        cursor.absorb(page, entity, index, registry)?;
        Ok(cursor)
    }

    fn absorb(
        &mut self,
        page: IndexQueryPage,
        entity: &EntityDef,
        index: &IndexDef,
        registry: &TranscodeRegistry,
    ) -> Result<(), AppError> {
        for item in page.items {
            let composite = entity.sort_composite(registry, Some(index), &item)?;
            self.buffer.push_back((composite, item));
        }
        self.next_page = page.page_key;
        Ok(())
    }
}

fn pick_winner(cursors: &[ShardCursor], scan_forward: bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, cursor) in cursors.iter().enumerate() {
        let Some((composite, _)) = cursor.buffer.front() else { continue };
        match best {
            None => best = Some(i),
            Some(j) => {
                let (best_composite, _) = cursors[j].buffer.front().expect("best has a head");
                let ahead = if scan_forward {
                    composite < best_composite
                } else {
                    composite > best_composite
                };
                // Equal composites fall back to shard order, already fixed
                // by the cursor sort, so `ahead` stays false and the lower
                // shard tag wins.
                if ahead {
                    best = Some(i);
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_codec::Delimiters;
    use crate::schema::SchemaRegistry;
    use crate::settings::QuerySettings;
    use crate::test_utils::{item, order_entity, order_item, seed, MemoryStore};
    use crate::transcode::TranscodeRegistry;

    fn engine(store: Arc<MemoryStore>) -> QueryEngine {
        let schemas =
            SchemaRegistry::new(vec![order_entity()], TranscodeRegistry::standard()).unwrap();
        QueryEngine::new(Arc::new(schemas), store, QuerySettings::default())
    }

    fn hash_acme() -> Item {
        item(&[("customer", Scalar::String("acme".to_string()))])
    }

    fn opts(time: TimeSpec) -> QueryOptions {
        QueryOptions::new("byCreated", hash_acme(), time)
    }

    async fn run(
        engine: &QueryEngine,
        configure: impl FnOnce(&mut ShardQuery),
        options: QueryOptions,
    ) -> Result<QueryResult, AppError> {
        let mut query = engine.shard_query("order").unwrap();
        configure(&mut query);
        query.query(options).await
    }

    fn seeded_engine(count: usize) -> (QueryEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let items: Vec<Item> =
            (0..count).map(|i| order_item(&format!("o-{:03}", i), "acme", 1_000 + i as i64, i as i64)).collect();
        seed(&store, &items);
        let engine = engine(store.clone());
        (engine, store)
    }

    #[tokio::test]
    async fn merges_shards_in_global_sort_order() {
        let (engine, _store) = seeded_engine(12);
        let result = run(&engine, |_| {}, opts(TimeSpec::Range { from: 0, to: 10_000 }))
            .await
            .unwrap();
        assert_eq!(result.count, 12);
        let created: Vec<i64> = result
            .items
            .iter()
            .map(|i| match i.get("created") {
                Some(Scalar::Timestamp(t)) => *t,
                other => panic!("missing created: {:?}", other),
            })
            .collect();
        let mut sorted = created.clone();
        sorted.sort_unstable();
        assert_eq!(created, sorted, "merge must preserve global sort order");
        assert!(result.page_key.is_none(), "drained query has no continuation");
    }

    #[tokio::test]
    async fn pagination_is_contiguous_without_duplicates_or_gaps() {
        let (engine, _store) = seeded_engine(23);
        let mut collected: Vec<String> = Vec::new();
        let mut page_key: Option<PageKey> = None;
        let mut rounds = 0;
        loop {
            let options = opts(TimeSpec::Range { from: 0, to: 10_000 })
                .with_limit(7)
                .with_page_size(5)
                .with_page_key(page_key.clone());
            let result = run(&engine, |_| {}, options).await.unwrap();
            for item in &result.items {
                match item.get("id") {
                    Some(Scalar::String(id)) => collected.push(id.clone()),
                    other => panic!("missing id: {:?}", other),
                }
            }
            rounds += 1;
            assert!(rounds < 10, "pagination must terminate");
            match result.page_key {
                Some(pk) => page_key = Some(pk),
                None => break,
            }
        }
        let expected: Vec<String> = (0..23).map(|i| format!("o-{:03}", i)).collect();
        assert_eq!(collected, expected, "every item exactly once, in order");
    }

    #[tokio::test]
    async fn duplicate_ids_across_shards_are_emitted_once() {
        // The same order rewritten after the bump lives in a narrow-regime
        // shard and a wide-regime shard; the merge keeps the first copy.
        let store = Arc::new(MemoryStore::new());
        let mut items = vec![
            order_item("o-dup", "acme", 1_500, 1),
            order_item("o-dup", "acme", 2_500, 2),
        ];
        items.extend((0..4).map(|i| order_item(&format!("o-{}", i), "acme", 1_000 + i, i)));
        seed(&store, &items);
        let engine = engine(store.clone());
        let result = run(&engine, |_| {}, opts(TimeSpec::Range { from: 0, to: 10_000 }))
            .await
            .unwrap();
        let dups = result
            .items
            .iter()
            .filter(|i| i.get("id") == Some(&Scalar::String("o-dup".to_string())))
            .count();
        assert_eq!(dups, 1, "one logical record, two physical copies, one result");
        assert_eq!(result.count, 5);
    }

    #[tokio::test]
    async fn reverse_scan_reverses_all_shards_uniformly() {
        let (engine, _store) = seeded_engine(9);
        let options = opts(TimeSpec::Range { from: 0, to: 10_000 }).backwards();
        let result = run(&engine, |_| {}, options).await.unwrap();
        let ids: Vec<String> = result
            .items
            .iter()
            .map(|i| i.get("id").unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..9).rev().map(|i| format!("o-{:03}", i)).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn range_condition_narrows_the_merge() {
        let (engine, _store) = seeded_engine(10);
        let options = opts(TimeSpec::Range { from: 0, to: 10_000 });
        let result = run(
            &engine,
            |q| {
                q.add_range_key_condition(
                    "byCreated",
                    Condition::Between("created".to_string(), Scalar::Timestamp(1_002), Scalar::Timestamp(1_005)),
                )
                .unwrap();
            },
            options,
        )
        .await
        .unwrap();
        let ids: Vec<String> = result.items.iter().map(|i| i.get("id").unwrap().to_string()).collect();
        assert_eq!(ids, vec!["o-002", "o-003", "o-004", "o-005"], "between is inclusive");
    }

    #[tokio::test]
    async fn pinned_timestamp_queries_a_single_shard() {
        let store = Arc::new(MemoryStore::new());
        let items: Vec<Item> = (0..6).map(|i| order_item(&format!("o-{}", i), "acme", 1_000, i)).collect();
        seed(&store, &items);
        let engine = engine(store.clone());
        // The entity key (the order id) pins the shard; hash values still
        // address the partition.
        let mut hash = hash_acme();
        hash.insert("id".to_string(), Scalar::String("o-3".to_string()));
        let options = QueryOptions::new("byCreated", hash, TimeSpec::At(1_000));
        let result = run(&engine, |_| {}, options).await.unwrap();
        assert_eq!(store.captured_queries().len(), 1, "a pinned timestamp must not fan out");
        assert!(
            result.items.iter().any(|i| i.get("id") == Some(&Scalar::String("o-3".to_string()))),
            "the pinned item's shard holds the item"
        );
    }

    #[tokio::test]
    async fn failed_shard_aborts_with_contributors() {
        let (engine, store) = seeded_engine(8);
        // Fail one concrete shard of the wide regime.
        let victim = "customer#acme|~shard#2";
        store.fail_hash_key(victim);
        let err = run(&engine, |_| {}, opts(TimeSpec::Range { from: 0, to: 10_000 }))
            .await
            .unwrap_err();
        match err {
            AppError::QueryAborted { entity, index, shard, .. } => {
                assert_eq!(entity, "order");
                assert_eq!(index, "byCreated");
                assert_eq!(shard, "2");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_index_fails_before_any_request() {
        let (engine, store) = seeded_engine(3);
        let err = run(&engine, |_| {}, QueryOptions::new("byNote", hash_acme(), TimeSpec::At(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownIndex { .. }));
        assert!(store.captured_queries().is_empty());
    }

    #[tokio::test]
    async fn projection_always_carries_id_and_sort_props() {
        let (engine, store) = seeded_engine(5);
        let options = opts(TimeSpec::Range { from: 0, to: 10_000 });
        let result = run(
            &engine,
            |q| q.set_projection("byCreated", &["total"]).unwrap(),
            options,
        )
        .await
        .unwrap();
        let sent = store.captured_queries();
        let projection = sent[0].projection.clone().expect("projection must be sent");
        for required in ["total", "created", "id"] {
            assert!(projection.iter().any(|a| a == required), "missing '{}'", required);
        }
        assert_eq!(result.projection.as_ref(), Some(&projection));
        // Projected items still decode to a usable key.
        for item in &result.items {
            assert!(item.contains_key("id") && item.contains_key("created"));
            assert!(!item.contains_key("note"), "unrequested attributes are dropped");
        }
    }

    #[tokio::test]
    async fn filters_are_compiled_and_sent_per_shard() {
        let (engine, store) = seeded_engine(4);
        let options = opts(TimeSpec::Range { from: 0, to: 10_000 });
        run(
            &engine,
            |q| {
                q.add_filter_condition("byCreated", Condition::Ge("total".to_string(), Scalar::BigInt(2)))
                    .unwrap();
                q.add_filter_condition(
                    "byCreated",
                    Condition::Not(Box::new(Condition::Contains("note".to_string(), Scalar::String("gift".to_string())))),
                )
                .unwrap();
            },
            options,
        )
        .await
        .unwrap();
        let sent = store.captured_queries();
        assert!(!sent.is_empty());
        for request in &sent {
            let filter = request.filter.as_ref().expect("filter must be sent");
            assert_eq!(filter.expression, "#n0 >= :v0 AND NOT (contains(#n1, :v1))");
            assert_eq!(filter.values.len(), 2);
        }
    }

    #[tokio::test]
    async fn range_condition_rejects_wrong_property_and_double_set() {
        let (engine, _store) = seeded_engine(1);
        let mut query = engine.shard_query("order").unwrap();
        let err = query
            .add_range_key_condition("byCreated", Condition::Eq("total".to_string(), Scalar::BigInt(1)))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidCondition(_)));
        query
            .add_range_key_condition("byCreated", Condition::Ge("created".to_string(), Scalar::Timestamp(5)))
            .unwrap();
        let err = query
            .add_range_key_condition("byCreated", Condition::Lt("created".to_string(), Scalar::Timestamp(9)))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidCondition(_)), "exactly one range condition");
    }

    #[test]
    fn upper_bound_closes_inclusive_bounds() {
        let d = Delimiters::default();
        let ub = upper_bound("created#11", d.pair);
        assert!(ub.as_str() > "created#11|x", "equal-valued composites stay inside");
        assert!(ub.as_str() < "created#12", "larger values stay outside");
    }

    #[test]
    fn shard_space_for_query_spans_regimes() {
        // Companion to the merge tests: the seeded entity uses one narrow
        // and one wide regime, so a full-range query fans out to both.
        let entity = order_entity();
        let space = entity.shard_key_space(0, 10_000).unwrap();
        assert_eq!(space.len(), 20, "four narrow keys plus sixteen wide keys");
    }
}
