use crate::error::AppError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Property value as stored in items and bound into query conditions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scalar {
    String(String),
    Bool(bool),
    Int(i64),
    Timestamp(i64),
    BigInt(i128),
}

impl Scalar {
    pub fn kind(&self) -> &'static str {
        match self {
            Scalar::String(_) => "string",
            Scalar::Bool(_) => "boolean",
            Scalar::Int(_) => "int",
            Scalar::Timestamp(_) => "timestamp",
            Scalar::BigInt(_) => "bigint",
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::String(s) => write!(f, "{}", s),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Timestamp(t) => write!(f, "{}", t),
            Scalar::BigInt(b) => write!(f, "{}", b),
        }
    }
}

/// Standard transcode names.
pub const STRING: &str = "string";
pub const BOOLEAN: &str = "boolean";
pub const INT: &str = "int";
pub const TIMESTAMP: &str = "timestamp";
pub const BIGINT: &str = "bigint";

/// Millisecond timestamps outside this magnitude are rejected on encode.
pub const TIMESTAMP_MAX_MS: i64 = 8_640_000_000_000_000;

const INT_WIDTH: usize = 19;
const TIMESTAMP_WIDTH: usize = 16;
const BIGINT_WIDTH: usize = 39;

/// Fixed-width, sign-prefixed decimal encoding that sorts like the value.
///
/// Non-negative values are `'1'` followed by `width` zero-padded digits.
/// Negative values are `'0'` followed by the nine's complement of the
/// zero-padded magnitude, so more-negative values sort first and every
/// negative sorts below every non-negative. Callers must ensure `|v|`
/// fits in `width` digits.
fn encode_signed(v: i128, width: usize) -> String {
    if v >= 0 {
        format!("1{:0width$}", v, width = width)
    } else {
        let digits = format!("{:0width$}", v.unsigned_abs(), width = width);
        let complement: String = digits.bytes().map(|b| (b'9' - (b - b'0')) as char).collect();
        format!("0{}", complement)
    }
}

fn decode_signed(s: &str, width: usize) -> Result<i128, String> {
    let bytes = s.as_bytes();
    if bytes.len() != width + 1 {
        return Err(format!("expected {} characters, got {}", width + 1, bytes.len()));
    }
    let digits = &s[1..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("non-decimal digit in encoded value".to_string());
    }
    match bytes[0] {
        b'1' => {
            let u = digits.parse::<u128>().map_err(|e| e.to_string())?;
            i128::try_from(u).map_err(|_| "value out of range".to_string())
        }
        b'0' => {
            let complement: String = digits.bytes().map(|b| (b'9' - (b - b'0')) as char).collect();
            let u = complement.parse::<u128>().map_err(|e| e.to_string())?;
            0i128.checked_sub_unsigned(u).ok_or_else(|| "value out of range".to_string())
        }
        other => Err(format!("invalid sign prefix '{}'", other as char)),
    }
}

/// One named encode/decode pair. Encoded strings sort exactly like the
/// underlying values under plain lexicographic comparison.
#[derive(Clone)]
pub struct Transcoder {
    encode: Arc<dyn Fn(&Scalar) -> Result<String, String> + Send + Sync>,
    decode: Arc<dyn Fn(&str) -> Result<Scalar, String> + Send + Sync>,
}

impl Transcoder {
    pub fn new(
        encode: impl Fn(&Scalar) -> Result<String, String> + Send + Sync + 'static,
        decode: impl Fn(&str) -> Result<Scalar, String> + Send + Sync + 'static,
    ) -> Self {
        Self { encode: Arc::new(encode), decode: Arc::new(decode) }
    }
}

/// Registry of transcoders keyed by name. Immutable once handed to a
/// schema; extend with [`TranscodeRegistry::with`] before that.
#[derive(Clone, Default)]
pub struct TranscodeRegistry {
    transcoders: HashMap<String, Transcoder>,
}

static STANDARD_REGISTRY: Lazy<TranscodeRegistry> = Lazy::new(|| {
    TranscodeRegistry::default()
        .with(
            STRING,
            Transcoder::new(
                |v| match v {
                    Scalar::String(s) => Ok(s.clone()),
                    other => Err(format!("expected string, got {}", other.kind())),
                },
                |s| Ok(Scalar::String(s.to_string())),
            ),
        )
        .with(
            BOOLEAN,
            Transcoder::new(
                |v| match v {
                    Scalar::Bool(false) => Ok("0".to_string()),
                    Scalar::Bool(true) => Ok("1".to_string()),
                    other => Err(format!("expected boolean, got {}", other.kind())),
                },
                |s| match s {
                    "0" => Ok(Scalar::Bool(false)),
                    "1" => Ok(Scalar::Bool(true)),
                    other => Err(format!("invalid boolean encoding '{}'", other)),
                },
            ),
        )
        .with(
            INT,
            Transcoder::new(
                |v| match v {
                    Scalar::Int(i) => Ok(encode_signed(*i as i128, INT_WIDTH)),
                    other => Err(format!("expected int, got {}", other.kind())),
                },
                |s| {
                    let v = decode_signed(s, INT_WIDTH)?;
                    let i = i64::try_from(v).map_err(|_| "value out of range".to_string())?;
                    Ok(Scalar::Int(i))
                },
            ),
        )
        .with(
            TIMESTAMP,
            Transcoder::new(
                |v| match v {
                    Scalar::Timestamp(t) if t.unsigned_abs() <= TIMESTAMP_MAX_MS as u64 => {
                        Ok(encode_signed(*t as i128, TIMESTAMP_WIDTH))
                    }
                    Scalar::Timestamp(t) => {
                        Err(format!("timestamp {} outside ±{} ms", t, TIMESTAMP_MAX_MS))
                    }
                    other => Err(format!("expected timestamp, got {}", other.kind())),
                },
                |s| {
                    let v = decode_signed(s, TIMESTAMP_WIDTH)?;
                    let t = i64::try_from(v).map_err(|_| "value out of range".to_string())?;
                    if t.unsigned_abs() > TIMESTAMP_MAX_MS as u64 {
                        return Err(format!("timestamp {} outside ±{} ms", t, TIMESTAMP_MAX_MS));
                    }
                    Ok(Scalar::Timestamp(t))
                },
            ),
        )
        .with(
            BIGINT,
            Transcoder::new(
                |v| match v {
                    Scalar::BigInt(b) => Ok(encode_signed(*b, BIGINT_WIDTH)),
                    other => Err(format!("expected bigint, got {}", other.kind())),
                },
                |s| decode_signed(s, BIGINT_WIDTH).map(Scalar::BigInt),
            ),
        )
});

impl TranscodeRegistry {
    /// The five standard transcodes: string, boolean, int, timestamp, bigint.
    pub fn standard() -> Self {
        STANDARD_REGISTRY.clone()
    }

    pub fn with(mut self, name: &str, transcoder: Transcoder) -> Self {
        self.transcoders.insert(name.to_string(), transcoder);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transcoders.contains_key(name)
    }

    pub fn encode(&self, name: &str, property: &str, value: &Scalar) -> Result<String, AppError> {
        let t = self.transcoders.get(name).ok_or_else(|| AppError::MissingTranscode {
            property: property.to_string(),
            transcode: name.to_string(),
        })?;
        (t.encode)(value).map_err(|reason| AppError::Encoding {
            property: property.to_string(),
            value: value.to_string(),
            reason,
        })
    }

    pub fn decode(&self, name: &str, input: &str) -> Result<Scalar, AppError> {
        let t = self.transcoders.get(name).ok_or_else(|| AppError::MissingTranscode {
            property: "<decode>".to_string(),
            transcode: name.to_string(),
        })?;
        (t.decode)(input).map_err(|reason| AppError::Decoding {
            transcode: name.to_string(),
            input: input.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn reg() -> TranscodeRegistry {
        TranscodeRegistry::standard()
    }

    fn enc(name: &str, v: &Scalar) -> String {
        reg().encode(name, "p", v).unwrap()
    }

    fn roundtrip(name: &str, v: Scalar) {
        let encoded = enc(name, &v);
        assert_eq!(reg().decode(name, &encoded).unwrap(), v, "roundtrip of {:?}", v);
    }

    // ---------- roundtrips at boundaries ----------

    #[test]
    fn int_roundtrips_boundaries() {
        for v in [i64::MIN, -1_000_000, -1, 0, 1, 42, i64::MAX] {
            roundtrip(INT, Scalar::Int(v));
        }
    }

    #[test]
    fn timestamp_roundtrips_boundaries() {
        for v in [-TIMESTAMP_MAX_MS, -1, 0, 1, 1_700_000_000_000, TIMESTAMP_MAX_MS] {
            roundtrip(TIMESTAMP, Scalar::Timestamp(v));
        }
    }

    #[test]
    fn bigint_roundtrips_boundaries() {
        for v in [i128::MIN, -1, 0, 1, i128::MAX] {
            roundtrip(BIGINT, Scalar::BigInt(v));
        }
    }

    #[test]
    fn string_is_identity_and_boolean_single_char() {
        roundtrip(STRING, Scalar::String("plain".to_string()));
        assert_eq!(enc(STRING, &Scalar::String("abc".to_string())), "abc");
        assert_eq!(enc(BOOLEAN, &Scalar::Bool(false)), "0");
        assert_eq!(enc(BOOLEAN, &Scalar::Bool(true)), "1");
        roundtrip(BOOLEAN, Scalar::Bool(true));
    }

    // ---------- order preservation ----------

    #[test]
    fn int_encoding_preserves_order() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let a: i64 = rng.random();
            let b: i64 = rng.random();
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            if lo == hi {
                continue;
            }
            assert!(
                enc(INT, &Scalar::Int(lo)) < enc(INT, &Scalar::Int(hi)),
                "{} must encode below {}",
                lo,
                hi
            );
        }
    }

    #[test]
    fn timestamp_encoding_preserves_order() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let a: i64 = rng.random_range(-TIMESTAMP_MAX_MS..=TIMESTAMP_MAX_MS);
            let b: i64 = rng.random_range(-TIMESTAMP_MAX_MS..=TIMESTAMP_MAX_MS);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            if lo == hi {
                continue;
            }
            assert!(enc(TIMESTAMP, &Scalar::Timestamp(lo)) < enc(TIMESTAMP, &Scalar::Timestamp(hi)));
        }
    }

    #[test]
    fn bigint_encoding_preserves_order() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let a: i128 = rng.random();
            let b: i128 = rng.random();
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            if lo == hi {
                continue;
            }
            assert!(enc(BIGINT, &Scalar::BigInt(lo)) < enc(BIGINT, &Scalar::BigInt(hi)));
        }
    }

    #[test]
    fn negatives_sort_below_positives_across_signs() {
        assert!(enc(INT, &Scalar::Int(-1)) < enc(INT, &Scalar::Int(0)));
        assert!(enc(INT, &Scalar::Int(i64::MIN)) < enc(INT, &Scalar::Int(-1)));
        assert!(enc(BOOLEAN, &Scalar::Bool(false)) < enc(BOOLEAN, &Scalar::Bool(true)));
    }

    // ---------- rejection ----------

    #[test]
    fn wrong_type_is_an_encoding_error() {
        let err = reg().encode(INT, "age", &Scalar::String("x".to_string())).unwrap_err();
        match err {
            AppError::Encoding { property, .. } => assert_eq!(property, "age"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn timestamp_out_of_range_is_rejected_not_truncated() {
        assert!(reg().encode(TIMESTAMP, "ts", &Scalar::Timestamp(TIMESTAMP_MAX_MS + 1)).is_err());
        assert!(reg().encode(TIMESTAMP, "ts", &Scalar::Timestamp(i64::MIN)).is_err());
    }

    #[test]
    fn malformed_input_is_a_decoding_error() {
        assert!(reg().decode(INT, "").is_err());
        assert!(reg().decode(INT, "2000000000000000000x").is_err());
        assert!(reg().decode(INT, "x0000000000000000001").is_err());
        assert!(reg().decode(BOOLEAN, "yes").is_err());
        let err = reg().decode(TIMESTAMP, "10000000000000000000").is_err();
        assert!(err, "wrong width must fail");
    }

    #[test]
    fn unknown_transcode_is_reported_with_property() {
        let err = reg().encode("uuid", "id", &Scalar::String("a".to_string())).unwrap_err();
        match err {
            AppError::MissingTranscode { property, transcode } => {
                assert_eq!(property, "id");
                assert_eq!(transcode, "uuid");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
