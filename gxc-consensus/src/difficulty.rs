use gxc_core::Hash32;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// Cumulative chainwork accumulator.
pub type ChainWork = U256;

/// Damping: one retarget may move difficulty by at most 4x either way.
const DAMPING: f64 = 0.25;
pub const MIN_DIFFICULTY: f64 = 1.0;
pub const MAX_DIFFICULTY: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetargetParams {
    /// Blocks between retargets; 2016 on mainnet, 10 in testing mode.
    pub interval: u32,
    /// Target seconds per block.
    pub block_time_target: u64,
}

impl RetargetParams {
    pub fn mainnet() -> Self {
        Self {
            interval: 2016,
            block_time_target: 600,
        }
    }

    pub fn testing() -> Self {
        Self {
            interval: 10,
            block_time_target: 10,
        }
    }

    pub fn expected_timespan(&self) -> u64 {
        self.interval as u64 * self.block_time_target
    }
}

/// 256-bit target for a real-valued difficulty: `floor(2^256 / 2^d)`,
/// interpolated through a 16-bit fixed-point scale for the fractional part.
pub fn target_for_difficulty(difficulty: f64) -> U256 {
    let d = difficulty.clamp(0.0, 255.0);
    let whole = d.floor() as usize;
    let frac = d - whole as f64;
    let base = U256::MAX >> whole;
    if frac == 0.0 {
        return base;
    }
    let scale = (65536.0 * 2f64.powf(-frac)) as u64;
    base / 65536u64 * scale
}

/// `arith_uint256`-style compact encoding of a target.
pub fn compact_from_target(target: U256) -> u32 {
    let bits = 256 - target.leading_zeros() as usize;
    let mut size = (bits + 7) / 8;
    let mut mantissa = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };
    // The sign bit of the mantissa must stay clear.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    mantissa | ((size as u32) << 24)
}

pub fn target_from_compact(compact: u32) -> U256 {
    let size = (compact >> 24) as usize;
    let mantissa = U256::from(compact & 0x007f_ffff);
    if size <= 3 {
        mantissa >> (8 * (3 - size))
    } else {
        mantissa << (8 * (size - 3))
    }
}

/// Hash interpreted as a big-endian 256-bit integer, for target comparison.
pub fn hash_to_u256(hash: &Hash32) -> U256 {
    U256::from_big_endian(hash)
}

pub fn meets_target(hash: &Hash32, difficulty: f64) -> bool {
    hash_to_u256(hash) < target_for_difficulty(difficulty)
}

/// Work contributed by one block: `floor(difficulty * 1e6)`, uniform across
/// block kinds.
pub fn block_work(difficulty: f64) -> ChainWork {
    U256::from((difficulty * 1e6).floor().max(0.0) as u64)
}

/// Next difficulty after a retarget window. The adjustment ratio is damped
/// to [0.25, 4] and the result clamped to [1, 100].
pub fn retarget(old_difficulty: f64, actual_timespan: u64, params: &RetargetParams) -> f64 {
    let expected = params.expected_timespan() as f64;
    let actual = (actual_timespan as f64).max(1.0);
    let ratio = (expected / actual).clamp(DAMPING, 1.0 / DAMPING);
    (old_difficulty * ratio).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}

/// Fork choice: higher cumulative work wins; on a tie the lexically lower
/// hash does.
pub fn better_tip(a_work: ChainWork, a_hash: &Hash32, b_work: ChainWork, b_hash: &Hash32) -> bool {
    a_work > b_work || (a_work == b_work && a_hash < b_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_monotone() {
        let t1 = target_for_difficulty(1.0);
        let t15 = target_for_difficulty(1.5);
        let t2 = target_for_difficulty(2.0);
        assert!(t1 > t15 && t15 > t2);
        assert_eq!(t2, U256::MAX >> 2);
    }

    #[test]
    fn compact_roundtrip_preserves_magnitude() {
        for d in [0.1, 1.0, 4.0, 17.25, 64.0] {
            let target = target_for_difficulty(d);
            let compact = compact_from_target(target);
            let back = target_from_compact(compact);
            // Compact keeps at least 15 mantissa bits; the round-trip must
            // stay within one part in 2^14 of the original.
            assert!(back <= target);
            assert!(back >= target - (target >> 14));
        }
    }

    #[test]
    fn retarget_speeds_up_and_slows_down() {
        let params = RetargetParams::mainnet();
        let expected = params.expected_timespan();
        // Blocks came in twice as fast: difficulty doubles.
        let up = retarget(4.0, expected / 2, &params);
        assert!((up - 8.0).abs() < 1e-9);
        // Twice as slow: difficulty halves.
        let down = retarget(4.0, expected * 2, &params);
        assert!((down - 2.0).abs() < 1e-9);
    }

    #[test]
    fn retarget_is_damped_and_bounded() {
        let params = RetargetParams::mainnet();
        // A pathological timespan may move difficulty at most 4x.
        let up = retarget(4.0, 1, &params);
        assert!((up - 16.0).abs() < 1e-9);
        let down = retarget(4.0, u64::MAX / 2, &params);
        assert!((down - 1.0).abs() < 1e-9);
        assert_eq!(retarget(90.0, 1, &params), MAX_DIFFICULTY);
    }

    #[test]
    fn work_accumulates_uniformly() {
        assert_eq!(block_work(0.1), U256::from(100_000u64));
        assert_eq!(block_work(4.0), U256::from(4_000_000u64));
    }

    #[test]
    fn fork_tie_breaks_on_lower_hash() {
        let work = U256::from(42u64);
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[0] = 0x0a;
        b[0] = 0x0b;
        assert!(better_tip(work, &a, work, &b));
        assert!(!better_tip(work, &b, work, &a));
        assert!(better_tip(work + 1, &b, work, &a));
    }

    #[test]
    fn low_difficulty_hash_meets_target() {
        // difficulty 0.1 leaves essentially the whole space valid.
        assert!(meets_target(&[0x7f; 32], 0.1));
        assert!(!meets_target(&[0xff; 32], 1.0));
    }
}
