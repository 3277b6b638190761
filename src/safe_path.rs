//! Checks on caller-supplied names that end up in filesystem paths.
//!
//! Checksums and file names are single path segments. Sub directories are
//! relative paths made of plain components only.

use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result};

/// A single segment: no separator, not `.` or `..`.
pub fn check_segment(field: &str, value: &str) -> Result<()> {
    if value.contains('/') || value.contains('\\') || value == "." || value == ".." || value.contains('\0') {
        return Err(EngineError::validation(format!("{} is not a plain name: {}", field, value)));
    }
    Ok(())
}

/// A path that cannot leave the directory it is joined to. Leading and
/// trailing slashes are ignored, empty is allowed.
pub fn check_relative(field: &str, value: &str) -> Result<()> {
    let trimmed = value.trim_matches('/');
    if value.contains('\\') || value.contains('\0') {
        return Err(EngineError::validation(format!("{} must be a plain relative path: {}", field, value)));
    }
    for component in Path::new(trimmed).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(EngineError::validation(format!(
                "{} contains an unsafe path component: {}",
                field, value
            )));
        }
    }
    Ok(())
}

/// Join `relative` onto `root`, refusing anything that would escape it.
pub fn join_under(root: &Path, relative: &str) -> Result<PathBuf> {
    check_relative("path", relative)?;
    let trimmed = relative.trim_matches('/');
    if trimmed.is_empty() {
        Ok(root.to_path_buf())
    } else {
        Ok(root.join(trimmed))
    }
}

/// True when `path` is absolute and made of plain components only.
pub fn is_plain_absolute(path: &Path) -> bool {
    path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
}
