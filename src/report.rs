//! Detection report rendering

use crate::detector::ComponentMatch;
use crate::{SporaResult, SporaError};
use std::path::Path;

/// Render detection results as pretty-printed JSON.
pub fn render(matches: &[ComponentMatch]) -> SporaResult<String> {
    serde_json::to_string_pretty(matches).map_err(SporaError::Serde)
}

/// Write the report to a file, or to stdout when no path is given.
pub fn write_report(matches: &[ComponentMatch], out: Option<&Path>) -> SporaResult<()> {
    let rendered = render(matches)?;
    match out {
        Some(path) => {
            std::fs::write(path, rendered.as_bytes()).map_err(|e| SporaError::StorageFailed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
        None => {
            println!("{rendered}");
            Ok(())
        }
    }
}
