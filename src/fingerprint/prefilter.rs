//! Digest prefilter — L-value bucketed nearest-match index
//!
//! The distance formula charges `12·|ΔL|`, so two digests whose L-values
//! differ by more than `τ / 12` can never be within τ. Bucketing by
//! L-value prunes most candidate pairs; every surviving candidate still
//! gets an exact distance computation, so results never depend on the
//! prefilter.

use crate::fingerprint::tlsh::Tlsh;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default)]
pub struct DigestIndex {
    by_l: HashMap<u8, Vec<(String, Tlsh)>>,
    len: usize,
}

impl DigestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from hex digests, skipping unparseable ones with a warning.
    pub fn from_hex<'a>(digests: impl Iterator<Item = &'a str>) -> Self {
        let mut index = Self::new();
        for hex in digests {
            match Tlsh::parse_hex(hex) {
                Ok(digest) => index.insert(hex.to_string(), digest),
                Err(e) => warn!("unindexable digest {hex:.16}…: {e}"),
            }
        }
        index
    }

    pub fn insert(&mut self, hex: String, digest: Tlsh) {
        self.by_l
            .entry(digest.l_value())
            .or_default()
            .push((hex, digest));
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Closest indexed digest within distance `tau` of `probe`, if any.
    /// Ties resolve to the lowest candidate L-value, then insertion order.
    pub fn nearest_within(&self, probe: &Tlsh, tau: u32) -> Option<(&str, u32)> {
        let radius = (tau / 12) as u8;
        let lo = probe.l_value().saturating_sub(radius);
        let hi = probe.l_value().saturating_add(radius);

        let mut best: Option<(&str, u32)> = None;
        for l in lo..=hi {
            let Some(bucket) = self.by_l.get(&l) else {
                continue;
            };
            for (hex, digest) in bucket {
                let dist = probe.distance(digest);
                if dist <= tau && best.map(|(_, d)| dist < d).unwrap_or(true) {
                    best = Some((hex.as_str(), dist));
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(seed: u8) -> Vec<u8> {
        (0..240u32).map(|i| (i as u8).wrapping_mul(seed) ^ seed).collect()
    }

    #[test]
    fn finds_exact_digest_at_distance_zero() {
        let digest = Tlsh::hash(&body(3)).unwrap();
        let mut index = DigestIndex::new();
        index.insert(digest.to_hex(), digest.clone());

        let (hex, dist) = index.nearest_within(&digest, 30).unwrap();
        assert_eq!(hex, digest.to_hex());
        assert_eq!(dist, 0);
    }

    #[test]
    fn distant_digests_are_rejected() {
        let a = Tlsh::hash(&body(3)).unwrap();
        let b = Tlsh::hash(&body(101)).unwrap();
        if a.distance(&b) <= 30 {
            // Seeds are chosen to differ; guard the premise explicitly.
            panic!("test bodies unexpectedly similar");
        }

        let mut index = DigestIndex::new();
        index.insert(b.to_hex(), b);
        assert!(index.nearest_within(&a, 30).is_none());
    }

    #[test]
    fn prefilter_never_hides_a_match_across_l_values() {
        // Inputs of different lengths land in different L buckets, so the
        // scan radius has to reach across buckets to find the match.
        let a = Tlsh::hash(&body(7)).unwrap();
        let long: Vec<u8> = body(7).into_iter().cycle().take(1000).collect();
        let b = Tlsh::hash(&long).unwrap();
        assert_ne!(a.l_value(), b.l_value());

        let real = a.distance(&b);
        let mut index = DigestIndex::new();
        index.insert(b.to_hex(), b);
        let found = index.nearest_within(&a, real);
        assert_eq!(found.map(|(_, d)| d), Some(real));
    }

    #[test]
    fn from_hex_skips_garbage() {
        let good = Tlsh::hash(&body(9)).unwrap().to_hex();
        let index = DigestIndex::from_hex(["nonsense", good.as_str()].into_iter());
        assert_eq!(index.len(), 1);
    }
}
