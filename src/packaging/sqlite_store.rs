//! SQLite implementation of the package store

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;
use std::sync::Arc;

use crate::bus::outbox;
use crate::bus::{BusEvent, FileArchiveRequestEvent, FileArchiveResponseEvent};
use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::model::{
    from_millis, to_millis, ArchiveSource, FileInBuildingPackage, FileStatus, PackageReference, PackageStatus,
};
use crate::packaging::aggregator::predicted_url;
use crate::packaging::{PackageStore, PackageTx};

const PACKAGE_COLUMNS: &str =
    "id, storage, storage_subdirectory, size, status, archive_name, stored_url, error_cause, creation_date";

const FILE_COLUMNS: &str = "id, storage_request_id, storage, checksum, filename, storage_subdirectory, \
     final_archive_parent_url, final_archive_parent_path, origin_url, size, status, package_id, \
     error_cause, creation_date, source";

fn parse_column<T: FromStr<Err = EngineError>>(index: usize, value: String) -> rusqlite::Result<T> {
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn package_from_row(row: &Row<'_>) -> rusqlite::Result<PackageReference> {
    Ok(PackageReference {
        id: row.get(0)?,
        storage: row.get(1)?,
        storage_subdirectory: row.get(2)?,
        size: row.get::<_, i64>(3)?.max(0) as u64,
        status: parse_column(4, row.get(4)?)?,
        archive_name: row.get(5)?,
        stored_url: row.get(6)?,
        error_cause: row.get(7)?,
        creation_date: from_millis(row.get(8)?),
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileInBuildingPackage> {
    Ok(FileInBuildingPackage {
        id: row.get(0)?,
        storage_request_id: row.get(1)?,
        storage: row.get(2)?,
        checksum: row.get(3)?,
        filename: row.get(4)?,
        storage_subdirectory: row.get(5)?,
        final_archive_parent_url: row.get(6)?,
        final_archive_parent_path: row.get(7)?,
        origin_url: row.get(8)?,
        size: row.get::<_, i64>(9)?.max(0) as u64,
        status: parse_column(10, row.get(10)?)?,
        package_id: row.get(11)?,
        error_cause: row.get(12)?,
        creation_date: from_millis(row.get(13)?),
        source: parse_column(14, row.get(14)?)?,
    })
}

fn load_file(conn: &Connection, source: ArchiveSource, request_id: i64) -> Result<Option<FileInBuildingPackage>> {
    let sql = format!(
        "SELECT {} FROM file_in_building_package WHERE source = ?1 AND storage_request_id = ?2",
        FILE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![source.as_str(), request_id], file_from_row)
        .optional()?)
}

fn load_package(conn: &Connection, id: i64) -> Result<Option<PackageReference>> {
    let sql = format!("SELECT {} FROM package_reference WHERE id = ?1", PACKAGE_COLUMNS);
    Ok(conn.query_row(&sql, params![id], package_from_row).optional()?)
}

fn load_files(conn: &Connection, package_id: i64) -> Result<Vec<FileInBuildingPackage>> {
    let sql = format!(
        "SELECT {} FROM file_in_building_package WHERE package_id = ?1 ORDER BY id",
        FILE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let files = stmt
        .query_map(params![package_id], file_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
}

fn update_package(conn: &Connection, package: &PackageReference) -> Result<()> {
    let changed = conn.execute(
        "UPDATE package_reference SET size = ?1, status = ?2, stored_url = ?3, error_cause = ?4 WHERE id = ?5",
        params![
            package.size as i64,
            package.status.as_str(),
            package.stored_url,
            package.error_cause,
            package.id
        ],
    )?;
    if changed == 0 {
        return Err(EngineError::NotFound(format!("package {}", package.id)));
    }
    Ok(())
}

fn update_file(conn: &Connection, file: &FileInBuildingPackage) -> Result<()> {
    let changed = conn.execute(
        "UPDATE file_in_building_package SET status = ?1, package_id = ?2, error_cause = ?3 WHERE id = ?4",
        params![file.status.as_str(), file.package_id, file.error_cause, file.id],
    )?;
    if changed == 0 {
        return Err(EngineError::NotFound(format!("packaged file {}", file.id)));
    }
    Ok(())
}

/// Transaction-scoped view used by the aggregator.
struct SqlitePackageTx<'t> {
    conn: &'t Connection,
}

impl PackageTx for SqlitePackageTx<'_> {
    fn waiting_files(&mut self, limit: usize) -> Result<Vec<FileInBuildingPackage>> {
        let sql = format!(
            "SELECT {} FROM file_in_building_package WHERE status = ?1 ORDER BY id LIMIT ?2",
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let files = stmt
            .query_map(params![FileStatus::WaitingPackage.as_str(), limit as i64], file_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    fn open_package(&mut self, storage: &str, subdirectory: &str) -> Result<Option<PackageReference>> {
        let sql = format!(
            "SELECT {} FROM package_reference WHERE storage = ?1 AND storage_subdirectory = ?2 AND status = ?3",
            PACKAGE_COLUMNS
        );
        let package = self
            .conn
            .query_row(
                &sql,
                params![storage, subdirectory, PackageStatus::Building.as_str()],
                package_from_row,
            )
            .optional()?;
        Ok(package)
    }

    fn create_package(
        &mut self,
        storage: &str,
        subdirectory: &str,
        archive_name: &str,
        now: DateTime<Utc>,
    ) -> Result<PackageReference> {
        self.conn.execute(
            "INSERT INTO package_reference (storage, storage_subdirectory, size, status, archive_name, creation_date)
             VALUES (?1, ?2, 0, ?3, ?4, ?5)",
            params![storage, subdirectory, PackageStatus::Building.as_str(), archive_name, to_millis(&now)],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Opened package {} ({}) for {}/{}", id, archive_name, storage, subdirectory);
        Ok(PackageReference {
            id,
            storage: storage.to_string(),
            storage_subdirectory: subdirectory.to_string(),
            size: 0,
            status: PackageStatus::Building,
            archive_name: archive_name.to_string(),
            stored_url: None,
            error_cause: None,
            creation_date: now,
        })
    }

    fn save_package(&mut self, package: &PackageReference) -> Result<()> {
        update_package(self.conn, package)
    }

    fn save_file(&mut self, file: &FileInBuildingPackage) -> Result<()> {
        update_file(self.conn, file)
    }

    fn enqueue(&mut self, event: &BusEvent) -> Result<()> {
        outbox::enqueue(self.conn, event)?;
        Ok(())
    }
}

/// Package store over the shared ledger database.
pub struct SqlitePackageStore {
    db: Arc<Database>,
}

impl SqlitePackageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl PackageStore for SqlitePackageStore {
    fn in_transaction(&self, work: &mut dyn FnMut(&mut dyn PackageTx) -> Result<()>) -> Result<()> {
        self.db.immediate(|tx| {
            let mut package_tx = SqlitePackageTx { conn: &**tx };
            work(&mut package_tx)
        })
    }

    fn insert_waiting(&self, event: &FileArchiveRequestEvent) -> Result<bool> {
        event.validate()?;
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO file_in_building_package
                     (storage_request_id, storage, checksum, filename, storage_subdirectory,
                      final_archive_parent_url, final_archive_parent_path, origin_url, size, status, creation_date,
                      source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(source, storage_request_id) DO NOTHING",
                params![
                    event.request_id,
                    event.storage,
                    event.checksum,
                    event.file_name,
                    event.storage_subdirectory,
                    event.final_archive_parent_url,
                    event.final_archive_parent_path,
                    event.origin_url,
                    event.file_size as i64,
                    FileStatus::WaitingPackage.as_str(),
                    to_millis(&Utc::now()),
                    event.source.as_str(),
                ],
            )?;
            if inserted == 0 {
                debug!("{} archive request {} already registered", event.source, event.request_id);
            }
            Ok(inserted == 1)
        })
    }

    fn reopen(&self, event: &FileArchiveRequestEvent) -> Result<Option<FileStatus>> {
        event.validate()?;
        self.db.immediate(|tx| {
            let Some(mut file) = load_file(tx, event.source, event.request_id)? else {
                return Ok(None);
            };
            let previous = file.status;
            match previous {
                FileStatus::WaitingPackage => {}
                FileStatus::Error => {
                    file.status = file.status.transition(FileStatus::WaitingPackage)?;
                    tx.execute(
                        "UPDATE file_in_building_package
                         SET storage = ?1, checksum = ?2, filename = ?3, storage_subdirectory = ?4,
                             final_archive_parent_url = ?5, final_archive_parent_path = ?6, origin_url = ?7,
                             size = ?8, status = ?9, package_id = NULL, error_cause = NULL, creation_date = ?10
                         WHERE id = ?11",
                        params![
                            event.storage,
                            event.checksum,
                            event.file_name,
                            event.storage_subdirectory,
                            event.final_archive_parent_url,
                            event.final_archive_parent_path,
                            event.origin_url,
                            event.file_size as i64,
                            file.status.as_str(),
                            to_millis(&Utc::now()),
                            file.id
                        ],
                    )?;
                    info!("{} archive request {} waits for a new package", event.source, event.request_id);
                }
                FileStatus::Building | FileStatus::Packaged => {
                    let package_id = file
                        .package_id
                        .ok_or_else(|| EngineError::Internal(format!("bound file {} has no package", file.id)))?;
                    let package = load_package(tx, package_id)?
                        .ok_or_else(|| EngineError::NotFound(format!("package {}", package_id)))?;
                    let url = predicted_url(&file.final_archive_parent_url, &package.archive_name, &file.filename);
                    outbox::enqueue(
                        tx,
                        &BusEvent::FileArchiveResponse(
                            FileArchiveResponseEvent::success(file.storage_request_id, url).with_source(file.source),
                        ),
                    )?;
                    debug!("{} archive request {} answered again from package {}", event.source, event.request_id, package_id);
                }
            }
            Ok(Some(previous))
        })
    }

    fn reject_request(&self, event: &FileArchiveRequestEvent, cause: &str) -> Result<()> {
        warn!("{} archive request {} rejected: {}", event.source, event.request_id, cause);
        self.db.with_conn(|conn| {
            outbox::enqueue(
                conn,
                &BusEvent::FileArchiveResponse(
                    FileArchiveResponseEvent::failure(event.request_id, cause).with_source(event.source),
                ),
            )?;
            Ok(())
        })
    }

    fn close_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<PackageReference>> {
        let sql = format!(
            "SELECT {} FROM package_reference WHERE status = ?1 AND creation_date < ?2 ORDER BY id",
            PACKAGE_COLUMNS
        );
        self.db.immediate(|tx| {
            let mut stmt = tx.prepare(&sql)?;
            let aged = stmt
                .query_map(params![PackageStatus::Building.as_str(), to_millis(&cutoff)], package_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut closed = Vec::with_capacity(aged.len());
            for mut package in aged {
                package.status = package.status.transition(PackageStatus::ToStore)?;
                update_package(tx, &package)?;
                info!(
                    "Closed aged package {} for {}/{} at {} bytes",
                    package.id, package.storage, package.storage_subdirectory, package.size
                );
                closed.push(package);
            }
            Ok(closed)
        })
    }

    fn find_package(&self, id: i64) -> Result<Option<PackageReference>> {
        self.db.with_conn(|conn| load_package(conn, id))
    }

    fn packages_by_status(&self, status: PackageStatus, limit: usize) -> Result<Vec<PackageReference>> {
        let sql = format!(
            "SELECT {} FROM package_reference WHERE status = ?1 ORDER BY id LIMIT ?2",
            PACKAGE_COLUMNS
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let packages = stmt
                .query_map(params![status.as_str(), limit as i64], package_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(packages)
        })
    }

    fn files_of_package(&self, package_id: i64) -> Result<Vec<FileInBuildingPackage>> {
        self.db.with_conn(|conn| load_files(conn, package_id))
    }

    fn find_file_by_request(&self, source: ArchiveSource, request_id: i64) -> Result<Option<FileInBuildingPackage>> {
        self.db.with_conn(|conn| load_file(conn, source, request_id))
    }

    fn mark_package_stored(&self, package_id: i64, stored_url: &str) -> Result<()> {
        self.db.immediate(|tx| {
            let mut package = load_package(tx, package_id)?
                .ok_or_else(|| EngineError::NotFound(format!("package {}", package_id)))?;
            package.status = package.status.transition(PackageStatus::Stored)?;
            package.stored_url = Some(stored_url.to_string());
            update_package(tx, &package)?;
            for mut file in load_files(tx, package_id)? {
                if file.status == FileStatus::Building {
                    file.status = file.status.transition(FileStatus::Packaged)?;
                    update_file(tx, &file)?;
                }
            }
            info!("Package {} stored at {}", package_id, stored_url);
            Ok(())
        })
    }

    fn mark_package_error(&self, package_id: i64, cause: &str) -> Result<usize> {
        self.db.immediate(|tx| {
            let mut package = load_package(tx, package_id)?
                .ok_or_else(|| EngineError::NotFound(format!("package {}", package_id)))?;
            if package.status == PackageStatus::Error {
                return Ok(0);
            }
            package.status = package.status.transition(PackageStatus::Error)?;
            package.error_cause = Some(cause.to_string());
            update_package(tx, &package)?;

            let mut failed = 0;
            for mut file in load_files(tx, package_id)? {
                if file.status != FileStatus::Building {
                    continue;
                }
                file.status = file.status.transition(FileStatus::Error)?;
                file.error_cause = Some(cause.to_string());
                update_file(tx, &file)?;
                outbox::enqueue(
                    tx,
                    &BusEvent::FileArchiveResponse(
                        FileArchiveResponseEvent::failure(file.storage_request_id, cause).with_source(file.source),
                    ),
                )?;
                failed += 1;
            }
            warn!("Package {} failed ({} files): {}", package_id, failed, cause);
            Ok(failed)
        })
    }
}
