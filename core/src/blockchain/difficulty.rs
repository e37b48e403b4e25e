// Compact target encoding, proof-of-work checks and epoch retargeting.
use crate::config::ConsensusParams;
use crate::crypto::decode_hash;
use crate::error::{ChainError, Result};
use primitive_types::{U256, U512};

pub fn compact_to_target(bits: u32) -> U256 {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 || exponent > 32 {
        return U256::zero();
    }

    if exponent <= 3 {
        U256::from(mantissa >> (8 * (3 - exponent)))
    } else {
        U256::from(mantissa) << (8 * (exponent - 3))
    }
}

pub fn target_to_compact(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let mut bytes = [0u8; 32];
    target.to_big_endian(&mut bytes);
    let first_non_zero = bytes.iter().position(|&b| b != 0).unwrap_or(31);
    let mut size = (32 - first_non_zero) as u32;

    let mut mantissa: u32 = if size <= 3 {
        let mut v: u32 = 0;
        for b in &bytes[first_non_zero..] {
            v = (v << 8) | *b as u32;
        }
        v << (8 * (3 - size))
    } else {
        ((bytes[first_non_zero] as u32) << 16)
            | ((bytes[first_non_zero + 1] as u32) << 8)
            | (bytes[first_non_zero + 2] as u32)
    };

    if (mantissa & 0x0080_0000) != 0 {
        mantissa >>= 8;
        size += 1;
    }

    (size << 24) | (mantissa & 0x007f_ffff)
}

pub fn hash_to_u256(hash_hex: &str) -> Result<U256> {
    Ok(U256::from_big_endian(&decode_hash(hash_hex)?))
}

/// `hash ≤ target`, both read as 256-bit big-endian integers.
pub fn meets_target(hash_hex: &str, bits: u32) -> Result<bool> {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return Err(ChainError::ProofOfWork(format!(
            "target bits 0x{:08x} decode to zero",
            bits
        )));
    }
    Ok(hash_to_u256(hash_hex)? <= target)
}

/// Expected hashes to find a block: 2^256 / (target + 1).
pub fn block_work(bits: u32) -> U256 {
    let target = compact_to_target(bits);
    if target.is_zero() || target == U256::MAX {
        return U256::one();
    }
    (!target / (target + U256::one())) + U256::one()
}

/// Scale the previous target by how long the last epoch actually took,
/// clamped to a factor of four either way and never easier than `max_bits`.
pub fn retarget(prev_bits: u32, actual_seconds: i64, params: &ConsensusParams) -> u32 {
    let expected = params.epoch_seconds().max(1);
    let actual = actual_seconds.clamp(expected / 4, expected * 4).max(1);

    let max_target = compact_to_target(params.max_bits);
    let prev_target = compact_to_target(prev_bits);
    let scaled = U512::from(prev_target) * U512::from(actual as u64) / U512::from(expected as u64);
    let next = U256::try_from(scaled).unwrap_or(max_target).min(max_target);

    let bits = target_to_compact(next);
    log::info!(
        "Retarget: actual={}s expected={}s bits 0x{:08x} -> 0x{:08x}",
        actual_seconds,
        expected,
        prev_bits,
        bits
    );
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAINNET_MAX_BITS, REGTEST_MAX_BITS};

    #[test]
    fn compact_round_trips() {
        for bits in [MAINNET_MAX_BITS, REGTEST_MAX_BITS, 0x1d00ffff, 0x1b0404cb] {
            assert_eq!(target_to_compact(compact_to_target(bits)), bits);
        }
    }

    #[test]
    fn mainnet_limit_has_six_zero_nibbles() {
        let target = compact_to_target(MAINNET_MAX_BITS);
        let mut bytes = [0u8; 32];
        target.to_big_endian(&mut bytes);
        assert_eq!(&bytes[..5], &[0, 0, 0, 0xff, 0xff]);
    }

    #[test]
    fn pow_comparison_is_inclusive() {
        let target = compact_to_target(0x1d00ffff);
        let mut bytes = [0u8; 32];
        target.to_big_endian(&mut bytes);
        let exact = hex::encode(bytes);
        assert!(meets_target(&exact, 0x1d00ffff).unwrap());

        let above = hex::encode({
            let mut b = bytes;
            b[31] = 1;
            b
        });
        assert!(!meets_target(&above, 0x1d00ffff).unwrap());
        assert!(meets_target(&exact, 0).is_err());
    }

    #[test]
    fn harder_targets_weigh_more() {
        assert!(block_work(0x1d00ffff) > block_work(MAINNET_MAX_BITS));
        assert!(block_work(REGTEST_MAX_BITS) >= U256::one());
    }

    #[test]
    fn retarget_clamps_factor() {
        let params = ConsensusParams::mainnet();
        let start = 0x1d00ffff;
        let expected = params.epoch_seconds();
        let prev = compact_to_target(start);

        // Blocks came in far too fast: at most 4x harder.
        let harder = compact_to_target(retarget(start, 1, &params));
        assert_eq!(target_to_compact(harder), target_to_compact(prev / 4));

        // On schedule: unchanged.
        assert_eq!(retarget(start, expected, &params), start);

        // Far too slow: 4x easier, but never past the network limit.
        let easier = compact_to_target(retarget(start, expected * 100, &params));
        assert_eq!(target_to_compact(easier), target_to_compact(prev * 4));
        assert_eq!(
            retarget(MAINNET_MAX_BITS, expected * 100, &params),
            MAINNET_MAX_BITS
        );
    }
}
