//! Comprehensive tests of the packaging engine

#[cfg(test)]
mod packaging_tests {
    use crate::bus::memory::InMemoryBus;
    use crate::bus::outbox::Outbox;
    use crate::bus::{BusEvent, FileArchiveRequestEvent, FileArchiveResponseEvent};
    use crate::database::Database;
    use crate::model::{ArchiveSource, FileStatus, PackageReference, PackageStatus};
    use crate::packaging::aggregator::{Aggregator, PackagingPolicy};
    use crate::packaging::sqlite_store::SqlitePackageStore;
    use crate::packaging::PackageStore;
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;
    use std::thread;

    const PARENT_URL: &str = "https://archive.example/tape/dir";

    fn policy() -> PackagingPolicy {
        PackagingPolicy {
            max_size_bytes: 1000,
            max_age: Duration::hours(12),
        }
    }

    fn archive_event(request_id: i64, size: u64) -> FileArchiveRequestEvent {
        FileArchiveRequestEvent {
            request_id,
            storage: "tape".to_string(),
            checksum: format!("checksum-{}", request_id),
            file_name: format!("file-{}.dat", request_id),
            storage_subdirectory: "dir".to_string(),
            final_archive_parent_url: PARENT_URL.to_string(),
            final_archive_parent_path: "/archive/dir".to_string(),
            file_size: size,
            origin_url: None,
            source: ArchiveSource::External,
        }
    }

    fn setup(page_size: usize) -> (Arc<Database>, Arc<SqlitePackageStore>, Aggregator) {
        let db = Arc::new(Database::open_in_memory().expect("Failed to open database"));
        let store = Arc::new(SqlitePackageStore::new(db.clone()));
        let aggregator = Aggregator::new(store.clone(), policy(), page_size);
        (db, store, aggregator)
    }

    fn seed_package(store: &dyn PackageStore, size: u64, created: DateTime<Utc>) -> PackageReference {
        let mut seeded = None;
        store
            .in_transaction(&mut |tx| {
                let mut package = tx.create_package("tape", "dir", &format!("seed-{}", size), created)?;
                package.size = size;
                tx.save_package(&package)?;
                seeded = Some(package);
                Ok(())
            })
            .expect("Failed to seed package");
        seeded.expect("package seeded")
    }

    fn all_packages(store: &dyn PackageStore) -> Vec<PackageReference> {
        let mut packages = Vec::new();
        for status in [PackageStatus::Building, PackageStatus::ToStore, PackageStatus::Stored, PackageStatus::Error] {
            packages.extend(store.packages_by_status(status, 100).unwrap());
        }
        packages.sort_by_key(|p| p.id);
        packages
    }

    fn published(db: &Arc<Database>) -> Vec<FileArchiveResponseEvent> {
        let bus = Arc::new(InMemoryBus::new(64));
        let mut rx = bus.watch();
        Outbox::new(db.clone(), bus, 100).flush().expect("Failed to flush outbox");
        let mut events = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            for event in batch.iter() {
                if let BusEvent::FileArchiveResponse(response) = event {
                    events.push(response.clone());
                }
            }
        }
        events
    }

    #[test]
    fn test_first_file_opens_a_package() {
        let (db, store, aggregator) = setup(10);
        assert!(store.insert_waiting(&archive_event(1, 100)).unwrap());

        let report = aggregator.run_pass(Utc::now()).unwrap();
        assert_eq!(report.bound, 1);
        assert_eq!(report.opened, 1);

        let packages = all_packages(store.as_ref());
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].size, 100);
        assert_eq!(packages[0].status, PackageStatus::Building);

        let file = store.find_file_by_request(ArchiveSource::External, 1).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Building);
        assert_eq!(file.package_id, Some(packages[0].id));

        let events = published(&db);
        assert_eq!(events.len(), 1);
        let url = events[0].file_url.clone().unwrap();
        println!("Predicted url: {}", url);
        assert!(url.starts_with(PARENT_URL));
        assert!(url.ends_with(".zip?fileName=file-1.dat"));
        assert!(url.contains(&packages[0].archive_name));
        assert!(!events[0].error);
    }

    #[test]
    fn test_tipping_file_closes_its_package() {
        let (_db, store, aggregator) = setup(10);
        let existing = seed_package(store.as_ref(), 950, Utc::now());
        store.insert_waiting(&archive_event(1, 100)).unwrap();

        aggregator.run_pass(Utc::now()).unwrap();

        let package = store.find_package(existing.id).unwrap().unwrap();
        assert_eq!(package.size, 1050);
        assert_eq!(package.status, PackageStatus::ToStore);
        let file = store.find_file_by_request(ArchiveSource::External, 1).unwrap().unwrap();
        assert_eq!(file.package_id, Some(existing.id));
        assert_eq!(all_packages(store.as_ref()).len(), 1);
    }

    #[test]
    fn test_file_after_close_opens_a_new_package() {
        let (_db, store, aggregator) = setup(10);
        let existing = seed_package(store.as_ref(), 950, Utc::now());
        store.insert_waiting(&archive_event(1, 100)).unwrap();
        store.insert_waiting(&archive_event(2, 100)).unwrap();

        let report = aggregator.run_pass(Utc::now()).unwrap();
        assert_eq!(report, crate::packaging::aggregator::PassReport { bound: 2, opened: 1, closed: 1 });

        let packages = all_packages(store.as_ref());
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].id, existing.id);
        assert_eq!((packages[0].size, packages[0].status), (1050, PackageStatus::ToStore));
        assert_eq!((packages[1].size, packages[1].status), (100, PackageStatus::Building));

        let first = store.find_file_by_request(ArchiveSource::External, 1).unwrap().unwrap();
        let second = store.find_file_by_request(ArchiveSource::External, 2).unwrap().unwrap();
        assert_eq!(first.package_id, Some(packages[0].id));
        assert_eq!(second.package_id, Some(packages[1].id));
    }

    #[test]
    fn test_concurrent_passes_close_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packages.sqlite");
        let db = Arc::new(Database::open_path(&path).unwrap());
        let store = SqlitePackageStore::new(db.clone());
        let existing = seed_package(&store, 950, Utc::now());
        store.insert_waiting(&archive_event(1, 100)).unwrap();
        store.insert_waiting(&archive_event(2, 100)).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let db = Arc::new(Database::open_path(&path).unwrap());
                    let aggregator = Aggregator::new(Arc::new(SqlitePackageStore::new(db)), policy(), 1);
                    aggregator.run_until_drained(Utc::now()).unwrap()
                })
            })
            .collect();
        let bound: usize = handles.into_iter().map(|h| h.join().unwrap().bound).sum();
        assert_eq!(bound, 2);

        let packages = all_packages(&store);
        assert_eq!(packages.len(), 2);
        assert_eq!((packages[0].id, packages[0].size), (existing.id, 1050));
        assert_eq!(packages[0].status, PackageStatus::ToStore);
        assert_eq!((packages[1].size, packages[1].status), (100, PackageStatus::Building));
        assert_ne!(
            store.find_file_by_request(ArchiveSource::External, 1).unwrap().unwrap().package_id,
            store.find_file_by_request(ArchiveSource::External, 2).unwrap().unwrap().package_id
        );
    }

    #[test]
    fn test_oversized_file_is_accepted_and_closes_alone() {
        let (_db, store, aggregator) = setup(10);
        store.insert_waiting(&archive_event(1, 5000)).unwrap();
        store.insert_waiting(&archive_event(2, 10)).unwrap();

        aggregator.run_pass(Utc::now()).unwrap();
        let packages = all_packages(store.as_ref());
        assert_eq!(packages.len(), 2);
        assert_eq!((packages[0].size, packages[0].status), (5000, PackageStatus::ToStore));
        assert_eq!((packages[1].size, packages[1].status), (10, PackageStatus::Building));
    }

    #[test]
    fn test_package_at_threshold_stays_open() {
        let (_db, store, aggregator) = setup(10);
        seed_package(store.as_ref(), 900, Utc::now());
        store.insert_waiting(&archive_event(1, 100)).unwrap();

        aggregator.run_pass(Utc::now()).unwrap();
        let packages = all_packages(store.as_ref());
        assert_eq!(packages.len(), 1);
        assert_eq!((packages[0].size, packages[0].status), (1000, PackageStatus::Building));
    }

    #[test]
    fn test_age_sweep_closes_only_old_packages() {
        let (_db, store, aggregator) = setup(10);
        let now = Utc::now();
        let old = seed_package(store.as_ref(), 10, now - Duration::hours(13));
        let fresh = {
            let mut created = None;
            store
                .in_transaction(&mut |tx| {
                    created = Some(tx.create_package("tape", "other", "fresh", now - Duration::hours(11))?);
                    Ok(())
                })
                .unwrap();
            created.unwrap()
        };

        let closed = aggregator.close_old_packages(now).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, old.id);
        assert_eq!(store.find_package(old.id).unwrap().unwrap().status, PackageStatus::ToStore);
        assert_eq!(store.find_package(fresh.id).unwrap().unwrap().status, PackageStatus::Building);
    }

    #[test]
    fn test_pass_without_waiting_files_is_noop() {
        let (db, store, aggregator) = setup(10);
        let existing = seed_package(store.as_ref(), 10, Utc::now());

        let report = aggregator.run_pass(Utc::now()).unwrap();
        assert_eq!(report, Default::default());
        let packages = all_packages(store.as_ref());
        assert_eq!(packages.len(), 1);
        assert_eq!((packages[0].id, packages[0].size), (existing.id, 10));
        assert_eq!(packages[0].status, PackageStatus::Building);
        assert!(published(&db).is_empty());
    }

    #[test]
    fn test_every_file_gets_exactly_one_response() {
        let (db, store, aggregator) = setup(3);
        for id in 1..=10 {
            store.insert_waiting(&archive_event(id, 150)).unwrap();
        }
        // duplicates of an already known request are ignored
        assert!(!store.insert_waiting(&archive_event(3, 150)).unwrap());

        let report = aggregator.run_until_drained(Utc::now()).unwrap();
        assert_eq!(report.bound, 10);
        assert_eq!(aggregator.run_until_drained(Utc::now()).unwrap().bound, 0);

        let mut ids: Vec<i64> = published(&db).iter().map(|e| e.request_id).collect();
        ids.sort();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());

        // 7 files of 150 bytes exceed 1000
        let packages = all_packages(store.as_ref());
        assert_eq!(packages[0].size, 1050);
        assert_eq!(packages[0].status, PackageStatus::ToStore);
        assert_eq!(packages[1].size, 450);
    }

    #[test]
    fn test_invalid_archive_request_is_rejected() {
        let (_db, store, _aggregator) = setup(10);
        let mut event = archive_event(1, 10);
        event.final_archive_parent_url = String::new();
        assert!(store.insert_waiting(&event).is_err());
        assert!(store.find_file_by_request(ArchiveSource::External, 1).unwrap().is_none());
    }

    #[test]
    fn test_store_outcome_updates_files() {
        let (db, store, aggregator) = setup(10);
        store.insert_waiting(&archive_event(1, 600)).unwrap();
        store.insert_waiting(&archive_event(2, 600)).unwrap();
        store.insert_waiting(&archive_event(3, 600)).unwrap();
        aggregator.run_pass(Utc::now()).unwrap();
        published(&db);

        let packages = all_packages(store.as_ref());
        let (closed, open) = (&packages[0], &packages[1]);
        store.mark_package_stored(closed.id, "file:///archive/dir/a.zip").unwrap();
        for file in store.files_of_package(closed.id).unwrap() {
            assert_eq!(file.status, FileStatus::Packaged);
        }
        // a stored package never goes back
        assert!(store.mark_package_error(closed.id, "late").is_err());

        assert_eq!(store.mark_package_error(open.id, "tape offline").unwrap(), 1);
        assert_eq!(store.mark_package_error(open.id, "tape offline").unwrap(), 0);
        let failures = published(&db);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].request_id, 3);
        assert!(failures[0].error);
        let file = store.find_file_by_request(ArchiveSource::External, 3).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Error);
        assert_eq!(file.error_cause.as_deref(), Some("tape offline"));
    }

    #[test]
    fn test_same_request_id_from_two_sources() {
        let (db, store, aggregator) = setup(10);
        let mut ledger_event = archive_event(1, 100);
        ledger_event.source = ArchiveSource::Ledger;
        ledger_event.file_name = "mine.dat".to_string();
        assert!(store.insert_waiting(&archive_event(1, 100)).unwrap());
        assert!(store.insert_waiting(&ledger_event).unwrap());

        aggregator.run_pass(Utc::now()).unwrap();
        let mut responses = published(&db);
        responses.sort_by_key(|r| r.source.as_str());
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].source, ArchiveSource::External);
        assert!(responses[0].file_url.as_deref().unwrap().ends_with("fileName=file-1.dat"));
        assert_eq!(responses[1].source, ArchiveSource::Ledger);
        assert!(responses[1].file_url.as_deref().unwrap().ends_with("fileName=mine.dat"));

        let mine = store.find_file_by_request(ArchiveSource::Ledger, 1).unwrap().unwrap();
        assert_eq!(mine.filename, "mine.dat");
        assert_eq!(mine.status, FileStatus::Building);
    }

    #[test]
    fn test_reopen_requeues_failed_files() {
        let (db, store, aggregator) = setup(10);
        store.insert_waiting(&archive_event(1, 100)).unwrap();
        aggregator.run_pass(Utc::now()).unwrap();
        let package = all_packages(store.as_ref()).remove(0);
        store.mark_package_error(package.id, "tape offline").unwrap();
        published(&db);

        assert!(!store.insert_waiting(&archive_event(1, 120)).unwrap());
        assert_eq!(store.reopen(&archive_event(1, 120)).unwrap(), Some(FileStatus::Error));
        let file = store.find_file_by_request(ArchiveSource::External, 1).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::WaitingPackage);
        assert_eq!((file.package_id, file.error_cause, file.size), (None, None, 120));

        // bound again into a fresh package
        assert_eq!(aggregator.run_pass(Utc::now()).unwrap().bound, 1);
        let packages = all_packages(store.as_ref());
        assert_eq!(packages.len(), 2);
        let responses = published(&db);
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].error);
    }

    #[test]
    fn test_reopen_answers_bound_files_again() {
        let (db, store, aggregator) = setup(10);
        assert_eq!(store.reopen(&archive_event(1, 100)).unwrap(), None);
        store.insert_waiting(&archive_event(1, 100)).unwrap();
        assert_eq!(store.reopen(&archive_event(1, 100)).unwrap(), Some(FileStatus::WaitingPackage));
        assert!(published(&db).is_empty());

        aggregator.run_pass(Utc::now()).unwrap();
        let first = published(&db);
        assert_eq!(store.reopen(&archive_event(1, 100)).unwrap(), Some(FileStatus::Building));
        let again = published(&db);
        assert_eq!(again, first);
        assert_eq!(all_packages(store.as_ref()).len(), 1);
    }
}
