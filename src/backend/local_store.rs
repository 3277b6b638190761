//! Local filesystem backend
//!
//! Files are kept under `<base_path>/<storage>/<sub_directory>/<checksum>`.
//! Packages are written as zip archives in the parent path the packaging
//! engine announced, so predicted URLs resolve once the archive exists.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::backend::{BackendAdapter, PackageContents, PackagedFile, WorkingFile};
use crate::config::StorageDefinition;
use crate::error::{EngineError, Result};
use crate::safe_path::{check_segment, is_plain_absolute, join_under};

const CACHE_DIR: &str = ".cache";

fn url_of(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn origin_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Zip entry for `packaged`, unique within the archive.
fn entry_name(names: &mut HashSet<String>, packaged: &PackagedFile) -> String {
    let mut entry = packaged.filename.clone();
    if names.contains(&entry) {
        entry = format!("{}_{}", packaged.checksum, packaged.filename);
    }
    let mut suffix = 1;
    while names.contains(&entry) {
        entry = format!("{}_{}_{}", packaged.checksum, suffix, packaged.filename);
        suffix += 1;
    }
    names.insert(entry.clone());
    entry
}

fn collect_named(dir: &Path, name: &str, skip: &Path, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path == skip {
            continue;
        }
        if path.is_dir() {
            collect_named(&path, name, skip, found)?;
        } else if path.file_name().map(|n| n == name).unwrap_or(false) {
            found.push(path);
        }
    }
    Ok(())
}

/// Filesystem implementation of BackendAdapter
pub struct LocalStore {
    name: String,
    root: PathBuf,
    cache: PathBuf,
    origin_root: Option<PathBuf>,
    subset_size: usize,
}

impl LocalStore {
    pub fn new(definition: &StorageDefinition) -> Result<Self> {
        let root = definition.root();
        let cache = root.join(CACHE_DIR);
        fs::create_dir_all(&cache)?;
        let origin_root = match &definition.origin_root {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Some(fs::canonicalize(dir)?)
            }
            None => None,
        };
        info!("Local storage {} rooted at {}", definition.name, root.display());
        Ok(Self {
            name: definition.name.clone(),
            root,
            cache,
            origin_root,
            subset_size: definition.subset_size.max(1),
        })
    }

    fn file_path(&self, sub_directory: Option<&str>, checksum: &str) -> Result<PathBuf> {
        check_segment("checksum", checksum)?;
        let dir = join_under(&self.root, sub_directory.unwrap_or_default())?;
        Ok(dir.join(checksum))
    }

    /// Directory a package is written to; always inside the storage root.
    fn package_dir(&self, contents: &PackageContents) -> Result<PathBuf> {
        if contents.parent_path.is_empty() {
            return join_under(&self.root, &contents.storage_subdirectory);
        }
        let relative = Path::new(&contents.parent_path).strip_prefix(&self.root).map_err(|_| {
            EngineError::backend(
                &self.name,
                format!("package path {} is outside the storage", contents.parent_path),
            )
        })?;
        join_under(&self.root, &relative.to_string_lossy())
    }

    /// Only absolute origins without parent components, and below the origin
    /// root when one is configured.
    fn checked_origin(&self, url: &str) -> Result<PathBuf> {
        let path = origin_path(url);
        if !is_plain_absolute(&path) {
            return Err(EngineError::backend(&self.name, format!("refusing origin {}", url)));
        }
        if let Some(allowed) = &self.origin_root {
            let resolved = fs::canonicalize(&path)
                .map_err(|e| EngineError::backend(&self.name, format!("cannot read {}: {}", path.display(), e)))?;
            if !resolved.starts_with(allowed) {
                return Err(EngineError::backend(
                    &self.name,
                    format!("origin {} is outside {}", url, allowed.display()),
                ));
            }
            return Ok(resolved);
        }
        Ok(path)
    }

    /// Stored copies of `checksum`, cache excluded.
    fn find(&self, checksum: &str) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        collect_named(&self.root, checksum, &self.cache, &mut found)?;
        Ok(found)
    }

    fn read_origin(&self, origin_url: Option<&str>, checksum: &str) -> Result<Vec<u8>> {
        if let Some(url) = origin_url {
            let path = self.checked_origin(url)?;
            return fs::read(&path)
                .map_err(|e| EngineError::backend(&self.name, format!("cannot read {}: {}", path.display(), e)));
        }
        match self.find(checksum)?.first() {
            Some(path) => Ok(fs::read(path)?),
            None => Err(EngineError::backend(&self.name, format!("no origin for {}", checksum))),
        }
    }

    fn verify(&self, file: &WorkingFile, bytes: &[u8]) -> Result<()> {
        if !file.algorithm.eq_ignore_ascii_case("md5") {
            return Ok(());
        }
        let computed = hex::encode(md5::compute(bytes).0);
        if computed != file.checksum.to_lowercase() {
            return Err(EngineError::backend(
                &self.name,
                format!("checksum mismatch: expected {}, computed {}", file.checksum, computed),
            ));
        }
        Ok(())
    }

    fn write_zip(&self, partial: &Path, contents: &PackageContents) -> Result<()> {
        let mut writer = ZipWriter::new(File::create(partial)?);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut names = HashSet::new();
        for packaged in &contents.files {
            let bytes = self.read_origin(packaged.origin_url.as_deref(), &packaged.checksum)?;
            let entry = entry_name(&mut names, packaged);
            if entry != packaged.filename {
                warn!("Duplicate entry {} in package {}, stored as {}", packaged.filename, contents.archive_name, entry);
            }
            writer.start_file(entry.as_str(), options).map_err(|e| self.zip_error(e))?;
            writer.write_all(&bytes)?;
        }
        writer.finish().map_err(|e| self.zip_error(e))?;
        Ok(())
    }

    fn zip_error(&self, e: zip::result::ZipError) -> EngineError {
        EngineError::backend(&self.name, format!("zip error: {}", e))
    }
}

impl BackendAdapter for LocalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, file: &WorkingFile) -> Result<String> {
        let bytes = self.read_origin(file.origin_url.as_deref(), &file.checksum)?;
        self.verify(file, &bytes)?;
        let target = self.file_path(file.sub_directory.as_deref(), &file.checksum)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &bytes)?;
        debug!("Stored {} ({} bytes) at {}", file.checksum, bytes.len(), target.display());
        Ok(url_of(&target))
    }

    fn store_package(&self, contents: &PackageContents) -> Result<String> {
        let dir = self.package_dir(contents)?;
        fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{}.zip", contents.archive_name));
        let partial = dir.join(format!("{}.zip.part", contents.archive_name));

        if let Err(e) = self.write_zip(&partial, contents) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                debug!("No partial archive to remove at {}: {}", partial.display(), cleanup);
            }
            return Err(e);
        }
        fs::rename(&partial, &target)?;

        info!(
            "Package {} written with {} files at {}",
            contents.archive_name,
            contents.files.len(),
            target.display()
        );
        Ok(url_of(&target))
    }

    fn delete(&self, checksum: &str, _storage: &str) -> Result<()> {
        let mut copies = self.find(checksum)?;
        let cached = self.cache.join(checksum);
        if cached.exists() {
            copies.push(cached);
        }
        if copies.is_empty() {
            debug!("Nothing to delete for {} on {}", checksum, self.name);
        }
        for path in copies {
            fs::remove_file(&path)?;
            debug!("Deleted {}", path.display());
        }
        Ok(())
    }

    fn restore(&self, file: &WorkingFile) -> Result<String> {
        let source = self
            .find(&file.checksum)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::backend(&self.name, format!("{} is not stored here", file.checksum)))?;
        let target = self.cache.join(&file.checksum);
        fs::copy(&source, &target)?;
        Ok(url_of(&target))
    }

    fn subset_size(&self) -> usize {
        self.subset_size
    }
}
