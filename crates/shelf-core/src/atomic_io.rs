use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;

/// Writes text through a temp file + rename so readers never observe
/// partial data. The temp file is created next to the destination so the
/// final rename stays on one filesystem.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let mut staged = NamedTempFile::new_in(parent_dir)
        .with_context(|| format!("failed to stage a file in {}", parent_dir.display()))?;
    staged
        .write_all(content.as_bytes())
        .with_context(|| format!("failed to write staged content for {}", path.display()))?;
    staged
        .persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
