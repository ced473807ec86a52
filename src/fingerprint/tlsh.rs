//! TLSH fuzzy hash kernel
//!
//! A locality-sensitive digest: small changes to the input move the digest
//! a small distance. The digest carries a checksum byte (first byte of the
//! input's SHA-256), an L-value (`floor(log2(len))`), two quartile-ratio
//! bytes, and 256 two-bit bucket levels packed two-per-byte.
//!
//! Exactly one distance formula is used everywhere:
//!
//! ```text
//! 12·|ΔL| + 12·(|ΔQ1| + |ΔQ2|) + Σ |bucket_i − bucket'_i|
//! ```

use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Inputs below this many bytes carry too little signal to hash.
pub const MIN_INPUT_LEN: usize = 50;

const BUCKET_COUNT: usize = 256;
const WINDOW_SIZE: usize = 5;
const DIGEST_BYTES: usize = BUCKET_COUNT / 2 + 4;

/// Hex digest length: 4 header bytes + 128 packed bucket bytes.
pub const DIGEST_HEX_LEN: usize = DIGEST_BYTES * 2;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashError {
    /// Expected outcome for tiny inputs; callers skip the record.
    #[error("input shorter than {MIN_INPUT_LEN} bytes")]
    InputTooSmall,

    #[error("digest is not {DIGEST_HEX_LEN} valid hex characters")]
    InvalidDigest,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Tlsh {
    checksum: u8,
    l_value: u8,
    q1_ratio: u8,
    q2_ratio: u8,
    buckets: [u8; BUCKET_COUNT],
}

impl Tlsh {
    /// Hash an input of at least [`MIN_INPUT_LEN`] bytes.
    pub fn hash(data: &[u8]) -> Result<Self, HashError> {
        if data.len() < MIN_INPUT_LEN {
            return Err(HashError::InputTooSmall);
        }

        let mut counts = [0u32; BUCKET_COUNT];
        for i in 0..data.len() - WINDOW_SIZE {
            let triplet = ((data[i] as u32) << 16)
                | ((data[i + 2] as u32) << 8)
                | data[i + 4] as u32;
            counts[(triplet % BUCKET_COUNT as u32) as usize] += 1;
        }

        let mut sorted = counts;
        sorted.sort_unstable();
        let q1 = sorted[BUCKET_COUNT / 4];
        let q2 = sorted[BUCKET_COUNT / 2];
        let q3 = sorted[3 * BUCKET_COUNT / 4];

        // q3 == 0 leaves the ratios undefined; pin them to zero so equal
        // inputs always produce equal digests.
        let (q1_ratio, q2_ratio) = if q3 == 0 {
            (0, 0)
        } else {
            (
                ((q1 as f64 / q3 as f64) * 16.0) as u8,
                ((q2 as f64 / q3 as f64) * 16.0) as u8,
            )
        };

        let mut buckets = [0u8; BUCKET_COUNT];
        for (level, &count) in buckets.iter_mut().zip(counts.iter()) {
            *level = if count <= q1 {
                0
            } else if count <= q2 {
                1
            } else if count <= q3 {
                2
            } else {
                3
            };
        }

        Ok(Self {
            checksum: Sha256::digest(data)[0],
            l_value: data.len().ilog2() as u8,
            q1_ratio,
            q2_ratio,
            buckets,
        })
    }

    /// Distance between two digests. Zero for identical digests; symmetric.
    pub fn distance(&self, other: &Self) -> u32 {
        let l_diff = self.l_value.abs_diff(other.l_value) as u32;
        let q_diff = self.q1_ratio.abs_diff(other.q1_ratio) as u32
            + self.q2_ratio.abs_diff(other.q2_ratio) as u32;
        let bucket_diff: u32 = self
            .buckets
            .iter()
            .zip(other.buckets.iter())
            .map(|(a, b)| a.abs_diff(*b) as u32)
            .sum();
        12 * l_diff + 12 * q_diff + bucket_diff
    }

    /// Parse the hex form produced by [`Tlsh::to_hex`].
    pub fn parse_hex(s: &str) -> Result<Self, HashError> {
        let raw = hex::decode(s).map_err(|_| HashError::InvalidDigest)?;
        if raw.len() != DIGEST_BYTES {
            return Err(HashError::InvalidDigest);
        }

        let mut buckets = [0u8; BUCKET_COUNT];
        for i in 0..BUCKET_COUNT / 2 {
            let byte = raw[i + 4];
            let (hi, lo) = (byte >> 4, byte & 0x0f);
            if hi > 3 || lo > 3 {
                return Err(HashError::InvalidDigest);
            }
            buckets[2 * i] = hi;
            buckets[2 * i + 1] = lo;
        }

        Ok(Self {
            checksum: raw[0],
            l_value: raw[1],
            q1_ratio: raw[2],
            q2_ratio: raw[3],
            buckets,
        })
    }

    pub fn to_hex(&self) -> String {
        let mut raw = [0u8; DIGEST_BYTES];
        raw[0] = self.checksum;
        raw[1] = self.l_value;
        raw[2] = self.q1_ratio;
        raw[3] = self.q2_ratio;
        for i in 0..BUCKET_COUNT / 2 {
            raw[i + 4] = (self.buckets[2 * i] << 4) | self.buckets[2 * i + 1];
        }
        hex::encode(raw)
    }

    pub fn l_value(&self) -> u8 {
        self.l_value
    }
}

impl fmt::Display for Tlsh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Tlsh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tlsh({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(fill: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| fill.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn rejects_small_input() {
        assert_eq!(
            Tlsh::hash(&[0u8; MIN_INPUT_LEN - 1]),
            Err(HashError::InputTooSmall)
        );
        assert!(Tlsh::hash(&[7u8; MIN_INPUT_LEN]).is_ok());
    }

    #[test]
    fn self_distance_is_zero() {
        let a = Tlsh::hash(&sample(3, 200)).unwrap();
        assert_eq!(a.distance(&a), 0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Tlsh::hash(&sample(3, 200)).unwrap();
        let b = Tlsh::hash(&sample(90, 321)).unwrap();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&b) > 0);
    }

    #[test]
    fn equal_inputs_hash_identically() {
        let body = b"static int compare_entries(const void *a, const void *b) { return 1; }";
        let a = Tlsh::hash(body).unwrap();
        let b = Tlsh::hash(body).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn l_value_is_floor_log2() {
        let a = Tlsh::hash(&sample(0, 64)).unwrap();
        assert_eq!(a.l_value(), 6);
        let b = Tlsh::hash(&sample(0, 127)).unwrap();
        assert_eq!(b.l_value(), 6);
        let c = Tlsh::hash(&sample(0, 128)).unwrap();
        assert_eq!(c.l_value(), 7);
    }

    #[test]
    fn hex_round_trip() {
        let a = Tlsh::hash(&sample(11, 500)).unwrap();
        let hex = a.to_hex();
        assert_eq!(hex.len(), DIGEST_HEX_LEN);
        let parsed = Tlsh::parse_hex(&hex).unwrap();
        assert_eq!(parsed, a);
        assert_eq!(parsed.distance(&a), 0);
    }

    #[test]
    fn parse_rejects_bad_digests() {
        assert_eq!(Tlsh::parse_hex("zz"), Err(HashError::InvalidDigest));
        assert_eq!(Tlsh::parse_hex("abcd"), Err(HashError::InvalidDigest));
        // Correct length but a bucket nibble above 3.
        let bad = format!("{:0width$}", 0, width = DIGEST_HEX_LEN - 1) + "f";
        assert_eq!(Tlsh::parse_hex(&bad), Err(HashError::InvalidDigest));
    }

    #[test]
    fn uniform_input_keeps_ratios_defined() {
        // A constant byte drives every window into one bucket; the upper
        // quartile is zero and the ratios must stay pinned rather than NaN.
        let a = Tlsh::hash(&[b'x'; 80]).unwrap();
        let b = Tlsh::hash(&[b'x'; 80]).unwrap();
        assert_eq!(a.distance(&b), 0);
        assert!(Tlsh::parse_hex(&a.to_hex()).is_ok());
    }

    #[test]
    fn minimum_length_input_hashes() {
        let body: Vec<u8> = (0..MIN_INPUT_LEN as u8).collect();
        let digest = Tlsh::hash(&body).unwrap();
        assert_eq!(digest.l_value(), 5);
    }
}
