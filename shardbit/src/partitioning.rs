use crate::error::AppError;
use crate::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use xxhash_rust::xxh32::xxh32;

pub const MIN_CHAR_BITS: u8 = 1;
pub const MAX_CHAR_BITS: u8 = 5;
pub const MAX_CHARS: u8 = 40;

/// Digit alphabet shared by every shard-key base (2^1 ..= 2^5). ASCII order
/// equals numeric order, so shard keys sort like their numeric value.
const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Seed pinned so shard keys stay stable across processes and releases.
const HASH_SEED: u32 = 0;

/// One shard-key-width regime, in effect from `timestamp` until the next
/// bump. `chars == 0` means the entity is unsharded under this regime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBump {
    pub timestamp: i64,
    pub char_bits: u8,
    pub chars: u8,
}

impl ShardBump {
    /// Regime in effect before any configured bump: unsharded.
    pub const INITIAL: ShardBump = ShardBump { timestamp: 0, char_bits: 1, chars: 0 };

    pub const fn new(timestamp: i64, char_bits: u8, chars: u8) -> Self {
        Self { timestamp, char_bits, chars }
    }

    /// Width of the shard-key space in bits.
    pub fn width_bits(&self) -> u32 {
        u32::from(self.char_bits) * u32::from(self.chars)
    }

    pub fn is_unsharded(&self) -> bool {
        self.chars == 0
    }
}

/// Validates a bump schedule: bounds on bits/chars, strictly increasing
/// timestamps, and a shard space that never shrinks. Fatal on violation;
/// a schedule is never partially accepted.
pub fn validate_bumps(context: &str, bumps: &[ShardBump]) -> Result<(), AppError> {
    let mut prev: Option<&ShardBump> = None;
    for bump in bumps {
        if bump.timestamp < 0 {
            return Err(AppError::Config(format!(
                "{}: bump timestamp {} is negative",
                context, bump.timestamp
            )));
        }
        if bump.char_bits < MIN_CHAR_BITS || bump.char_bits > MAX_CHAR_BITS {
            return Err(AppError::Config(format!(
                "{}: char_bits {} outside [{}, {}]",
                context, bump.char_bits, MIN_CHAR_BITS, MAX_CHAR_BITS
            )));
        }
        if bump.chars > MAX_CHARS {
            return Err(AppError::Config(format!(
                "{}: chars {} exceeds {}",
                context, bump.chars, MAX_CHARS
            )));
        }
        if let Some(p) = prev {
            if bump.timestamp <= p.timestamp {
                return Err(AppError::Config(format!(
                    "{}: bump timestamps must be strictly increasing ({} after {})",
                    context, bump.timestamp, p.timestamp
                )));
            }
            if bump.width_bits() < p.width_bits() {
                return Err(AppError::Config(format!(
                    "{}: shard space may only grow ({} bits after {} bits)",
                    context,
                    bump.width_bits(),
                    p.width_bits()
                )));
            }
        }
        prev = Some(bump);
    }
    Ok(())
}

/// The regime in effect at `timestamp`: the last bump not after it, or the
/// implicit unsharded initial regime when none qualifies. Assumes a
/// validated (sorted, unique) schedule.
pub fn find_bump(bumps: &[ShardBump], timestamp: i64) -> ShardBump {
    bumps
        .iter()
        .rev()
        .find(|b| b.timestamp <= timestamp)
        .copied()
        .unwrap_or(ShardBump::INITIAL)
}

/// Renders a hash as a fixed-width shard key under `bump`, or `None` for an
/// unsharded regime. The hash is reduced modulo the shard space; widths
/// beyond 32 bits leave the high digits at zero because the hash itself is
/// 32-bit.
pub fn render_shard_key(hash: u32, bump: &ShardBump) -> Option<String> {
    if bump.is_unsharded() {
        return None;
    }
    let bits = u32::from(bump.char_bits);
    let mask = (1u32 << bits) - 1;
    let mut key = String::with_capacity(bump.chars as usize);
    for i in (0..u32::from(bump.chars)).rev() {
        let shift = i * bits;
        let digit = if shift >= 32 { 0 } else { ((hash >> shift) & mask) as usize };
        key.push(DIGITS[digit] as char);
    }
    Some(key)
}

/// Deterministic shard key for an entity key under `bump`.
pub fn shard_key(entity_key: &str, bump: &ShardBump) -> Option<String> {
    render_shard_key(xxh32(entity_key.as_bytes(), HASH_SEED), bump)
}

/// Every shard key of one regime, ascending. Only keys reachable from a
/// 32-bit hash are produced; regimes wider than 32 bits cannot address the
/// rest of their space.
fn enumerate_regime(bump: &ShardBump) -> Vec<Option<String>> {
    if bump.is_unsharded() {
        return vec![None];
    }
    let width = bump.width_bits().min(32);
    if width > 16 {
        warn!(
            "enumerating {} shard keys for a {}-bit regime; expect heavy fan-out",
            1u64 << width,
            bump.width_bits()
        );
    }
    let count = 1u64 << width;
    (0..count).map(|i| render_shard_key(i as u32, bump)).collect()
}

/// The union of shard keys across every regime active at any point of
/// `[from, to]`, narrowest regime first, each regime ascending, duplicate
/// regimes collapsed. Includes the unsharded marker whenever an in-range
/// regime has `chars == 0`. Old data lives under the regime of its write
/// time, so a complete read of the range must cover all of them.
pub fn shard_key_space(
    bumps: &[ShardBump],
    from: i64,
    to: i64,
) -> Result<Vec<Option<String>>, AppError> {
    if from > to {
        return Err(AppError::Config(format!(
            "shard key space range inverted: {} > {}",
            from, to
        )));
    }
    let mut space = Vec::new();
    let mut seen: HashSet<(u8, u8)> = HashSet::new();
    // All unsharded regimes produce the same marker, whatever their bits.
    let regime_key =
        |bump: &ShardBump| if bump.chars == 0 { (0, 0) } else { (bump.char_bits, bump.chars) };

    // Implicit initial regime covers everything before the first bump.
    let first_start = bumps.first().map_or(i64::MAX, |b| b.timestamp);
    if from < first_start {
        seen.insert(regime_key(&ShardBump::INITIAL));
        space.extend(enumerate_regime(&ShardBump::INITIAL));
    }

    for (i, bump) in bumps.iter().enumerate() {
        let end = bumps.get(i + 1).map_or(i64::MAX, |next| next.timestamp);
        let active = bump.timestamp <= to && end > from;
        if active && seen.insert(regime_key(bump)) {
            space.extend(enumerate_regime(bump));
        }
    }
    Ok(space)
}
