//! Detector-level scenarios: normalization equivalence, near-match
//! classification, and too-small inputs.

use spora::attribution::AttributionEngine;
use spora::detector::Detector;
use spora::fingerprint::{normalized_body, ExtractedFunction, ExtractedIndex, Tlsh};
use spora::preprocessor::Preprocessor;
use spora::storage::{ArtifactStore, HidxEntry, HidxHeader};
use spora::{CancelToken, ComponentMatch, SporaConfig};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    store: ArtifactStore,
    config: SporaConfig,
    pool: rayon::ThreadPool,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_layout().unwrap();
        Self {
            _dir: dir,
            store,
            config: SporaConfig::default(),
            pool: rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        }
    }

    /// One single-tag component whose signature is the given digests.
    fn seed_component(&self, repo: &str, tag: &str, hashes: &[(String, &str)]) {
        let header = HidxHeader {
            repo: repo.to_string(),
            files: 1,
            functions: hashes.len(),
            lines: 40 * hashes.len(),
        };
        let entries: Vec<HidxEntry> = hashes
            .iter()
            .map(|(hash, file)| HidxEntry {
                hash: hash.clone(),
                file: file.to_string(),
                name: "f".into(),
                start_line: 1,
                end_line: 25,
            })
            .collect();
        self.store
            .write_hidx(repo, tag, &header, entries.into_iter())
            .unwrap();
        self.store
            .write_tagdates(repo, &[("2018-08-08".to_string(), tag.to_string())])
            .unwrap();

        Preprocessor::new(&self.store, &self.pool, CancelToken::new())
            .run()
            .unwrap();
        let ave = self.store.read_ave_funcs().unwrap();
        AttributionEngine::new(&self.config, &self.store, &self.pool, CancelToken::new())
            .run(&ave)
            .unwrap();
    }

    fn detect(&self, target: &ExtractedIndex) -> Vec<ComponentMatch> {
        Detector::new(&self.config, &self.store, &self.pool, CancelToken::new())
            .match_index(target)
            .unwrap()
    }
}

fn target_with(digests: &[(Tlsh, &str)]) -> ExtractedIndex {
    let mut index = ExtractedIndex::default();
    for (digest, path) in digests {
        index.functions.insert(
            digest.to_hex(),
            ExtractedFunction {
                file: path.to_string(),
                name: "f".into(),
                start_line: 1,
                end_line: 25,
                digest: digest.clone(),
                paths: vec![path.to_string()],
            },
        );
    }
    index
}

/// Build a digest from explicit header and bucket bytes.
fn digest_from_parts(l_value: u8, level_one_bytes: usize) -> Tlsh {
    let mut hex = format!("00{l_value:02x}0000");
    for byte_idx in 0..128 {
        hex.push_str(if byte_idx < level_one_bytes { "11" } else { "00" });
    }
    Tlsh::parse_hex(&hex).expect("constructed digest must parse")
}

/// Whitespace and comment reformatting yields the identical fingerprint,
/// so a reformatted copy is classified `used`.
#[test]
fn reformatted_function_is_an_exact_hit() {
    let fx = Fixture::new();

    let original =
        "int checksum(const char *buf, int len) { int acc = 0; \
         for (int i = 0; i < len; ++i) { acc = acc * 31 + buf[i]; } return acc; }";
    let reformatted = "int checksum(const char *buf, int len)\n\
                       {\n\
                       \t// accumulate a rolling value\n\
                       \tint acc = 0;\n\
                       \tfor (int i = 0; i < len; ++i)\n\
                       \t{\n\
                       \t\tacc = acc * 31 + buf[i];  /* overflow fine */\n\
                       \t}\n\
                       \treturn acc;\n\
                       }";

    let original_digest = Tlsh::hash(normalized_body(original).as_bytes()).unwrap();
    let target_digest = Tlsh::hash(normalized_body(reformatted).as_bytes()).unwrap();
    assert_eq!(original_digest, target_digest);

    fx.seed_component(
        "hashlib",
        "v2.1",
        &[(original_digest.to_hex(), "src/checksum.c")],
    );

    let matches = fx.detect(&target_with(&[(target_digest, "vendor/checksum.c")]));
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].component, "hashlib");
    assert_eq!(matches[0].used, 1);
    assert_eq!(matches[0].modified, 0);
    assert!(!matches[0].structural_change);
}

/// A target fingerprint at a small, non-zero distance is classified
/// `modified` and still counts toward detection.
#[test]
fn near_match_is_classified_modified() {
    let fx = Fixture::new();

    // Distance 12: six bucket bytes differ by one level in each nibble.
    let component_digest = digest_from_parts(7, 0);
    let target_digest = digest_from_parts(7, 6);
    assert_eq!(component_digest.distance(&target_digest), 12);

    fx.seed_component(
        "editlib",
        "v1",
        &[(component_digest.to_hex(), "src/edit.c")],
    );

    let matches = fx.detect(&target_with(&[(target_digest, "third_party/edit.c")]));
    assert_eq!(matches.len(), 1);
    let m = &matches[0];
    assert_eq!(m.used, 0);
    assert_eq!(m.modified, 1);
    assert_eq!(m.unused, 0);
    assert_eq!(m.predicted_version, "v1");
    assert_eq!(m.matched_hashes, vec![component_digest.to_hex()]);
    assert!(!m.structural_change);
}

/// Beyond τ there is no match at all.
#[test]
fn far_digest_is_not_a_match() {
    let fx = Fixture::new();

    let component_digest = digest_from_parts(7, 0);
    // 16 changed bytes → 32 nibble levels → distance 32 > τ = 30.
    let target_digest = digest_from_parts(7, 16);
    assert_eq!(component_digest.distance(&target_digest), 32);

    fx.seed_component("farlib", "v1", &[(component_digest.to_hex(), "src/f.c")]);
    let matches = fx.detect(&target_with(&[(target_digest, "x.c")]));
    assert!(matches.is_empty());
}

/// A function whose normalized body is below the hash minimum never
/// enters an index, and its absence is not an error anywhere.
#[test]
fn too_small_function_is_silently_skipped() {
    let fx = Fixture::new();

    let tiny = normalized_body("int id(int x) { return x; }");
    assert!(tiny.len() < 50);
    assert!(Tlsh::hash(tiny.as_bytes()).is_err());

    let big = "int grow(int x) { int r = x; for (int i = 0; i < 100; ++i) \
               { r += i * x + 17; } return r - x * 3 + 11; }";
    let big_digest = Tlsh::hash(normalized_body(big).as_bytes()).unwrap();

    fx.seed_component("mixed", "v1", &[(big_digest.to_hex(), "src/big.c")]);

    // The tiny function simply does not appear in the target index; the
    // big one still matches cleanly.
    let matches = fx.detect(&target_with(&[(big_digest, "src/big.c")]));
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].used, 1);
}

/// Several components over one target: each is evaluated independently
/// and reported in sorted order.
#[test]
fn multiple_components_report_sorted() {
    let fx = Fixture::new();

    let a = digest_from_parts(7, 0);
    let mut hex_b = String::from("00070000");
    for byte_idx in 0..128 {
        hex_b.push_str(if byte_idx >= 100 { "22" } else { "00" });
    }
    let b = Tlsh::parse_hex(&hex_b).unwrap();
    assert!(a.distance(&b) > 30);

    // Seed both components in one store, then run the passes once.
    let header = |repo: &str, n: usize| HidxHeader {
        repo: repo.to_string(),
        files: 1,
        functions: n,
        lines: 40,
    };
    fx.store
        .write_hidx(
            "zeta",
            "v1",
            &header("zeta", 1),
            std::iter::once(HidxEntry {
                hash: a.to_hex(),
                file: "src/a.c".into(),
                name: "f".into(),
                start_line: 1,
                end_line: 25,
            }),
        )
        .unwrap();
    fx.store
        .write_tagdates("zeta", &[("2019-01-01".into(), "v1".into())])
        .unwrap();
    fx.store
        .write_hidx(
            "alpha",
            "v3",
            &header("alpha", 1),
            std::iter::once(HidxEntry {
                hash: b.to_hex(),
                file: "src/b.c".into(),
                name: "g".into(),
                start_line: 1,
                end_line: 25,
            }),
        )
        .unwrap();
    fx.store
        .write_tagdates("alpha", &[("2019-01-01".into(), "v3".into())])
        .unwrap();

    Preprocessor::new(&fx.store, &fx.pool, CancelToken::new())
        .run()
        .unwrap();
    let ave = fx.store.read_ave_funcs().unwrap();
    AttributionEngine::new(&fx.config, &fx.store, &fx.pool, CancelToken::new())
        .run(&ave)
        .unwrap();

    let matches = fx.detect(&target_with(&[(a, "x/a.c"), (b, "y/b.c")]));
    let names: Vec<&str> = matches.iter().map(|m| m.component.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}
