use std::path::Path;

/// Write a string to a file atomically: write to a `.tmp` sibling, then rename.
///
/// A crash mid-write leaves the original file untouched. The temp file lands
/// in the same directory so the rename never crosses a filesystem boundary.
pub fn atomic_write_str(path: &Path, content: &str) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("No parent directory for {}", path.display()))?;
    if !parent.exists() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("Failed to write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Failed to rename into {}: {}", path.display(), e))?;
    Ok(())
}
