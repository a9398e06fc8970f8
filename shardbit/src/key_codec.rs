use crate::error::AppError;

/// Delimiters used when composing composite keys. The defaults (`|` between
/// pairs, `#` between key and value) must not occur in any transcoded value;
/// that is a configuration responsibility, not enforced here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delimiters {
    pub pair: char,
    pub kv: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self { pair: '|', kv: '#' }
    }
}

/// Joins `key#value` pairs with the pair delimiter, in the order given.
/// Callers supply a canonical order so that encoded keys sort as intended.
pub fn encode_pairs(pairs: &[(String, String)], delims: &Delimiters) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}{}{}", k, delims.kv, v))
        .collect::<Vec<_>>()
        .join(&delims.pair.to_string())
}

/// Splits a composite key back into pairs. Every segment must contain the
/// key/value delimiter exactly once; anything else is a malformed key.
pub fn decode_pairs(serialized: &str, delims: &Delimiters) -> Result<Vec<(String, String)>, AppError> {
    if serialized.is_empty() {
        return Ok(Vec::new());
    }
    let mut pairs = Vec::new();
    for segment in serialized.split(delims.pair) {
        let mut parts = segment.split(delims.kv);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(v), None) if !k.is_empty() => {
                pairs.push((k.to_string(), v.to_string()));
            }
            _ => return Err(AppError::MalformedKey(segment.to_string())),
        }
    }
    Ok(pairs)
}

/// Reserved component name carrying the shard token inside encoded hash
/// keys and page keys. Property names starting with `~` are reserved.
pub const SHARD_COMPONENT: &str = "~shard";

/// Continuation token for a paginated query. Carries the boundary item's
/// key components (transcoded, in sort order, unique id included) plus the
/// shard that produced the boundary item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageKey {
    pub shard: Option<String>,
    pub components: Vec<(String, String)>,
}

impl PageKey {
    pub fn encode(&self, delims: &Delimiters) -> String {
        let mut pairs = Vec::with_capacity(self.components.len() + 1);
        if let Some(shard) = &self.shard {
            pairs.push((SHARD_COMPONENT.to_string(), shard.clone()));
        }
        pairs.extend(self.components.iter().cloned());
        encode_pairs(&pairs, delims)
    }

    pub fn decode(serialized: &str, delims: &Delimiters) -> Result<Self, AppError> {
        let mut shard = None;
        let mut components = Vec::new();
        for (k, v) in decode_pairs(serialized, delims)? {
            if k == SHARD_COMPONENT {
                shard = Some(v);
            } else {
                components.push((k, v));
            }
        }
        Ok(Self { shard, components })
    }
}
