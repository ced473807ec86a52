//! Function fingerprinting — TLSH kernel, body normalization, and the
//! ctags-driven extractor that turns C/C++ sources into fingerprint records.

pub mod extractor;
pub mod normalize;
pub mod prefilter;
pub mod tlsh;

pub use extractor::{ExtractStats, ExtractedFunction, ExtractedIndex, Extractor};
pub use normalize::{normalize, normalized_body, strip_comments};
pub use prefilter::DigestIndex;
pub use tlsh::{HashError, Tlsh};
