//! Binding of waiting files to packages.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::{BusEvent, FileArchiveResponseEvent};
use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::model::{FileStatus, PackageStatus, PackageReference};
use crate::packaging::{PackageStore, PackageTx};

static ARCHIVE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Size and age thresholds that close a package.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackagingPolicy {
    /// A package closes once its size is strictly greater than this.
    pub max_size_bytes: u64,
    pub max_age: Duration,
}

impl PackagingPolicy {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes(),
            max_age: config.max_age(),
        }
    }
}

/// What one aggregation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub bound: usize,
    pub opened: usize,
    pub closed: usize,
}

impl PassReport {
    fn absorb(&mut self, other: PassReport) {
        self.bound += other.bound;
        self.opened += other.opened;
        self.closed += other.closed;
    }
}

/// Opaque, package-scoped token used as the archive file name.
pub fn archive_name(storage: &str, subdirectory: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let counter = ARCHIVE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!("{}|{}|{}|{}|{}", storage, subdirectory, nanos, std::process::id(), counter);
    hex::encode(md5::compute(seed.as_bytes()).0)
}

/// Address a file will have once its package is written.
pub fn predicted_url(parent_url: &str, archive_name: &str, filename: &str) -> String {
    let separator = if parent_url.is_empty() || parent_url.ends_with('/') { "" } else { "/" };
    format!("{}{}{}.zip?fileName={}", parent_url, separator, archive_name, filename)
}

pub struct Aggregator {
    store: Arc<dyn PackageStore>,
    policy: PackagingPolicy,
    page_size: usize,
}

impl Aggregator {
    pub fn new(store: Arc<dyn PackageStore>, policy: PackagingPolicy, page_size: usize) -> Self {
        Self {
            store,
            policy,
            page_size: page_size.max(1),
        }
    }

    /// Bind one page of waiting files in a single transaction.
    pub fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport::default();
        let policy = self.policy;
        let page_size = self.page_size;
        self.store.in_transaction(&mut |tx| {
            report = bind_page(tx, &policy, page_size, now)?;
            Ok(())
        })?;
        if report.bound > 0 {
            info!(
                "Packaging pass bound {} files, opened {} packages, closed {}",
                report.bound, report.opened, report.closed
            );
        }
        Ok(report)
    }

    /// Run passes until no file is waiting.
    pub fn run_until_drained(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut total = PassReport::default();
        loop {
            let report = self.run_pass(now)?;
            total.absorb(report);
            if report.bound < self.page_size {
                return Ok(total);
            }
        }
    }

    /// Close every `BUILDING` package older than the configured max age.
    pub fn close_old_packages(&self, now: DateTime<Utc>) -> Result<Vec<PackageReference>> {
        self.store.close_older_than(now - self.policy.max_age)
    }
}

fn bind_page(tx: &mut dyn PackageTx, policy: &PackagingPolicy, limit: usize, now: DateTime<Utc>) -> Result<PassReport> {
    let mut report = PassReport::default();
    for mut file in tx.waiting_files(limit)? {
        // re-read on every file: an earlier file may have closed the package
        let mut package = match tx.open_package(&file.storage, &file.storage_subdirectory)? {
            Some(package) => package,
            None => {
                report.opened += 1;
                let name = archive_name(&file.storage, &file.storage_subdirectory);
                tx.create_package(&file.storage, &file.storage_subdirectory, &name, now)?
            }
        };

        package.size += file.size;
        if package.size > policy.max_size_bytes {
            package.status = package.status.transition(PackageStatus::ToStore)?;
            report.closed += 1;
            debug!(
                "Package {} closed at {} bytes by file {}",
                package.id, package.size, file.checksum
            );
        }
        tx.save_package(&package)?;

        file.status = file.status.transition(FileStatus::Building)?;
        file.package_id = Some(package.id);
        tx.save_file(&file)?;

        let url = predicted_url(&file.final_archive_parent_url, &package.archive_name, &file.filename);
        tx.enqueue(&BusEvent::FileArchiveResponse(
            FileArchiveResponseEvent::success(file.storage_request_id, url).with_source(file.source),
        ))?;
        report.bound += 1;
    }
    Ok(report)
}
