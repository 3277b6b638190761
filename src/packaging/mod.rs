//! Packaging engine
//!
//! Small files destined for the same `(storage, subdirectory)` are bound to a
//! growing `PackageReference` until a size or age threshold closes it. Each
//! bound file is answered immediately with the URL it will have once the
//! package is physically written.

pub mod aggregator;
pub mod sqlite_store;

#[cfg(test)]
mod comprehensive_test;

use chrono::{DateTime, Utc};

use crate::bus::{BusEvent, FileArchiveRequestEvent};
use crate::error::Result;
use crate::model::{ArchiveSource, FileInBuildingPackage, FileStatus, PackageReference, PackageStatus};

/// Operations available inside one packaging transaction.
pub trait PackageTx {
    /// Oldest `WAITING_PACKAGE` files, ordered by id.
    fn waiting_files(&mut self, limit: usize) -> Result<Vec<FileInBuildingPackage>>;

    /// The `BUILDING` package of a key, read from the store on every call.
    fn open_package(&mut self, storage: &str, subdirectory: &str) -> Result<Option<PackageReference>>;

    fn create_package(
        &mut self,
        storage: &str,
        subdirectory: &str,
        archive_name: &str,
        now: DateTime<Utc>,
    ) -> Result<PackageReference>;

    /// Persist size and status of a package.
    fn save_package(&mut self, package: &PackageReference) -> Result<()>;

    /// Persist status, binding and error cause of a file.
    fn save_file(&mut self, file: &FileInBuildingPackage) -> Result<()>;

    /// Queue an event for publication once the transaction commits.
    fn enqueue(&mut self, event: &BusEvent) -> Result<()>;
}

/// Durable storage of packages and of the files bound to them.
pub trait PackageStore: Send + Sync {
    /// Run `work` atomically. Concurrent callers are serialized.
    fn in_transaction(&self, work: &mut dyn FnMut(&mut dyn PackageTx) -> Result<()>) -> Result<()>;

    /// Record an archive request as a `WAITING_PACKAGE` file. Returns false if
    /// the request was already known.
    fn insert_waiting(&self, event: &FileArchiveRequestEvent) -> Result<bool>;

    /// Bring an already known request back into play. A failed file waits
    /// for a new package; a bound file is answered again with its URL.
    /// Returns the status the file had, or `None` if it is unknown.
    fn reopen(&self, event: &FileArchiveRequestEvent) -> Result<Option<FileStatus>>;

    /// Answer an archive request that cannot be packaged with a failed
    /// `FileArchiveResponseEvent`.
    fn reject_request(&self, event: &FileArchiveRequestEvent, cause: &str) -> Result<()>;

    /// `BUILDING -> TO_STORE` for every package created before `cutoff`.
    fn close_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<PackageReference>>;

    fn find_package(&self, id: i64) -> Result<Option<PackageReference>>;

    fn packages_by_status(&self, status: PackageStatus, limit: usize) -> Result<Vec<PackageReference>>;

    fn files_of_package(&self, package_id: i64) -> Result<Vec<FileInBuildingPackage>>;

    fn find_file_by_request(&self, source: ArchiveSource, request_id: i64) -> Result<Option<FileInBuildingPackage>>;

    /// `TO_STORE -> STORED`, and every bound file `-> PACKAGED`.
    fn mark_package_stored(&self, package_id: i64, stored_url: &str) -> Result<()>;

    /// Package and bound files `-> ERROR`; queues one failed
    /// `FileArchiveResponseEvent` per file. Returns the number of files.
    fn mark_package_error(&self, package_id: i64, cause: &str) -> Result<usize>;
}
