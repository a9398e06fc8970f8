use crate::error::AppError;
use crate::key_codec::{encode_pairs, Delimiters, SHARD_COMPONENT};
use crate::partitioning::{self, ShardBump};
use crate::storage::{Item, ItemKey};
use crate::transcode::TranscodeRegistry;
use std::collections::HashMap;
use std::sync::Arc;

pub type EntityKeyFn = Arc<dyn Fn(&Item) -> Option<String> + Send + Sync>;
pub type TimestampFn = Arc<dyn Fn(&Item) -> Option<i64> + Send + Sync>;

/// One secondary index: its key components and what it may project.
#[derive(Clone, Debug)]
pub struct IndexDef {
    pub token: String,
    pub hash_props: Vec<String>,
    pub range_props: Vec<String>,
    /// Attributes a caller-supplied projection may name; `None` allows any.
    pub projection: Option<Vec<String>>,
    pub page_size: Option<usize>,
}

impl IndexDef {
    pub fn new(token: &str, hash_props: &[&str], range_props: &[&str]) -> Self {
        Self {
            token: token.to_string(),
            hash_props: hash_props.iter().map(|p| p.to_string()).collect(),
            range_props: range_props.iter().map(|p| p.to_string()).collect(),
            projection: None,
            page_size: None,
        }
    }

    pub fn with_projection(mut self, attrs: &[&str]) -> Self {
        self.projection = Some(attrs.iter().map(|a| a.to_string()).collect());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }
}

/// One logical entity type: key layout, shard schedule, indexes, extractor
/// functions and per-property transcode assignments. Immutable once loaded
/// into a [`SchemaRegistry`]; shared read-only across operations.
#[derive(Clone)]
pub struct EntityDef {
    pub token: String,
    pub table: String,
    pub hash_props: Vec<String>,
    pub range_props: Vec<String>,
    /// Property whose value uniquely identifies one record.
    pub id_prop: String,
    pub bumps: Vec<ShardBump>,
    pub indexes: HashMap<String, IndexDef>,
    /// Property name -> transcode name.
    pub transcodes: HashMap<String, String>,
    pub delims: Delimiters,
    pub entity_key: EntityKeyFn,
    pub timestamp_of: TimestampFn,
}

impl EntityDef {
    /// A minimal definition. The entity key defaults to the unique-id
    /// property's display value; the timestamp extractor defaults to
    /// "not derivable" and must be set for sharded entities.
    pub fn new(token: &str, table: &str, id_prop: &str) -> Self {
        let id = id_prop.to_string();
        Self {
            token: token.to_string(),
            table: table.to_string(),
            hash_props: Vec::new(),
            range_props: Vec::new(),
            id_prop: id.clone(),
            bumps: Vec::new(),
            indexes: HashMap::new(),
            transcodes: HashMap::new(),
            delims: Delimiters::default(),
            entity_key: Arc::new(move |item: &Item| item.get(&id).map(|v| v.to_string())),
            timestamp_of: Arc::new(|_| None),
        }
    }

    pub fn with_hash_props(mut self, props: &[&str]) -> Self {
        self.hash_props = props.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_range_props(mut self, props: &[&str]) -> Self {
        self.range_props = props.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_bumps(mut self, bumps: &[ShardBump]) -> Self {
        self.bumps = bumps.to_vec();
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.insert(index.token.clone(), index);
        self
    }

    pub fn with_transcode(mut self, prop: &str, transcode: &str) -> Self {
        self.transcodes.insert(prop.to_string(), transcode.to_string());
        self
    }

    pub fn with_entity_key(mut self, f: impl Fn(&Item) -> Option<String> + Send + Sync + 'static) -> Self {
        self.entity_key = Arc::new(f);
        self
    }

    pub fn with_timestamp(mut self, f: impl Fn(&Item) -> Option<i64> + Send + Sync + 'static) -> Self {
        self.timestamp_of = Arc::new(f);
        self
    }

    pub fn index(&self, token: &str) -> Result<&IndexDef, AppError> {
        self.indexes.get(token).ok_or_else(|| AppError::UnknownIndex {
            entity: self.token.clone(),
            index: token.to_string(),
        })
    }

    pub fn transcode_of(&self, prop: &str) -> Result<&str, AppError> {
        self.transcodes.get(prop).map(String::as_str).ok_or_else(|| {
            AppError::Config(format!("entity '{}': property '{}' has no transcode assigned", self.token, prop))
        })
    }

    /// Encodes one property of `source` with its assigned transcode.
    pub fn encode_prop(
        &self,
        registry: &TranscodeRegistry,
        source: &Item,
        prop: &str,
    ) -> Result<String, AppError> {
        let value = source.get(prop).ok_or_else(|| {
            AppError::new(format!("entity '{}': property '{}' missing from item", self.token, prop))
        })?;
        registry.encode(self.transcode_of(prop)?, prop, value)
    }

    /// Sort components of the primary record or one index: the declared
    /// range properties with the unique id appended when absent. The id
    /// makes the composite globally unique, which pagination relies on.
    pub fn sort_props(&self, index: Option<&IndexDef>) -> Vec<String> {
        let base = index.map_or(&self.range_props, |i| &i.range_props);
        let mut props = base.clone();
        if !props.iter().any(|p| p == &self.id_prop) {
            props.push(self.id_prop.clone());
        }
        props
    }

    /// Shard key for an item under the regime of its own timestamp.
    /// `Ok(None)` means the item's regime is unsharded.
    pub fn shard_key(&self, item: &Item) -> Result<Option<String>, AppError> {
        let ts = (self.timestamp_of)(item).ok_or_else(|| {
            AppError::new(format!("entity '{}': timestamp not derivable from item", self.token))
        })?;
        let key = (self.entity_key)(item).ok_or_else(|| {
            AppError::new(format!("entity '{}': entity key not derivable from item", self.token))
        })?;
        Ok(partitioning::shard_key(&key, &partitioning::find_bump(&self.bumps, ts)))
    }

    /// Every shard that may hold data written within `[from, to]`.
    pub fn shard_key_space(&self, from: i64, to: i64) -> Result<Vec<Option<String>>, AppError> {
        partitioning::shard_key_space(&self.bumps, from, to)
    }

    /// Physical partition composite for the primary record or one index:
    /// hash properties in declared order, shard token appended under its
    /// reserved component name.
    pub fn physical_hash_key(
        &self,
        registry: &TranscodeRegistry,
        index: Option<&IndexDef>,
        source: &Item,
        shard: &Option<String>,
    ) -> Result<String, AppError> {
        let hash_props = index.map_or(&self.hash_props, |i| &i.hash_props);
        let mut pairs = Vec::with_capacity(hash_props.len() + 1);
        for prop in hash_props {
            pairs.push((prop.clone(), self.encode_prop(registry, source, prop)?));
        }
        if let Some(shard) = shard {
            pairs.push((SHARD_COMPONENT.to_string(), shard.clone()));
        }
        Ok(encode_pairs(&pairs, &self.delims))
    }

    /// Physical range composite of `item` for the primary record or one
    /// index: sort properties in canonical order, id included.
    pub fn sort_composite(
        &self,
        registry: &TranscodeRegistry,
        index: Option<&IndexDef>,
        item: &Item,
    ) -> Result<String, AppError> {
        let mut pairs = Vec::new();
        for prop in self.sort_props(index) {
            let encoded = self.encode_prop(registry, item, &prop)?;
            pairs.push((prop, encoded));
        }
        Ok(encode_pairs(&pairs, &self.delims))
    }

    /// Full physical key of an item, shard included. Batch deletes and
    /// writers address records by this key.
    pub fn item_key(&self, registry: &TranscodeRegistry, item: &Item) -> Result<ItemKey, AppError> {
        let shard = self.shard_key(item)?;
        Ok(ItemKey {
            hash: self.physical_hash_key(registry, None, item, &shard)?,
            range: self.sort_composite(registry, None, item)?,
        })
    }

    /// A new definition with one more bump appended. The original is left
    /// untouched, so concurrent readers never observe a half-updated
    /// schedule; swap the registry value to roll the new schedule out.
    pub fn bumped(&self, bump: ShardBump) -> Result<EntityDef, AppError> {
        let mut next = self.clone();
        next.bumps.push(bump);
        partitioning::validate_bumps(&next.token, &next.bumps)?;
        Ok(next)
    }
}

/// All entity definitions plus the transcode registry, validated as a
/// whole at load time and shared read-only afterwards.
pub struct SchemaRegistry {
    entities: HashMap<String, Arc<EntityDef>>,
    transcodes: TranscodeRegistry,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new(entities: Vec<EntityDef>, transcodes: TranscodeRegistry) -> Result<Self, AppError> {
        let mut map: HashMap<String, Arc<EntityDef>> = HashMap::new();
        for entity in entities {
            validate_entity(&entity, &transcodes)?;
            let token = entity.token.clone();
            if map.insert(token.clone(), Arc::new(entity)).is_some() {
                return Err(AppError::Config(format!("duplicate entity token '{}'", token)));
            }
        }
        Ok(Self { entities: map, transcodes })
    }

    pub fn entity(&self, token: &str) -> Result<Arc<EntityDef>, AppError> {
        self.entities.get(token).cloned().ok_or_else(|| AppError::UnknownEntity(token.to_string()))
    }

    pub fn transcodes(&self) -> &TranscodeRegistry {
        &self.transcodes
    }
}

fn validate_entity(entity: &EntityDef, transcodes: &TranscodeRegistry) -> Result<(), AppError> {
    if entity.token.is_empty() || entity.table.is_empty() {
        return Err(AppError::Config("entity token and table must be non-empty".to_string()));
    }
    if entity.hash_props.is_empty() {
        return Err(AppError::Config(format!(
            "entity '{}': at least one hash-key property is required",
            entity.token
        )));
    }
    partitioning::validate_bumps(&entity.token, &entity.bumps)?;

    let mut keyed_props: Vec<&String> = Vec::new();
    keyed_props.extend(&entity.hash_props);
    keyed_props.extend(&entity.range_props);
    keyed_props.push(&entity.id_prop);
    for (token, index) in &entity.indexes {
        if token != &index.token {
            return Err(AppError::Config(format!(
                "entity '{}': index registered under '{}' but named '{}'",
                entity.token, token, index.token
            )));
        }
        if index.hash_props.is_empty() {
            return Err(AppError::Config(format!(
                "entity '{}': index '{}' needs at least one hash-key property",
                entity.token, index.token
            )));
        }
        if let Some(page_size) = index.page_size {
            if page_size == 0 {
                return Err(AppError::Config(format!(
                    "entity '{}': index '{}' page size must be positive",
                    entity.token, index.token
                )));
            }
        }
        keyed_props.extend(&index.hash_props);
        keyed_props.extend(&index.range_props);
    }

    for prop in keyed_props {
        let name = entity.transcode_of(prop)?;
        if !transcodes.contains(name) {
            return Err(AppError::MissingTranscode {
                property: prop.clone(),
                transcode: name.to_string(),
            });
        }
    }
    Ok(())
}
