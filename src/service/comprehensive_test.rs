//! Comprehensive tests of dispatch and archive intake

#[cfg(test)]
mod service_tests {
    use crate::backend::mock_store::MockStore;
    use crate::backend::{BackendAdapter, BackendRegistry, FileOutcome, PackageContents, WorkingFile, WorkingSubset};
    use crate::bus::memory::InMemoryBus;
    use crate::bus::outbox::Outbox;
    use crate::bus::{BatchHandler, BusEvent, FileArchiveRequestEvent, FileArchiveResponseEvent, MessageBus};
    use crate::config::{BackendKind, StorageDefinition};
    use crate::database::Database;
    use crate::error::{EngineError, Result};
    use crate::ledger::sqlite_store::SqliteLedger;
    use crate::ledger::RequestLedger;
    use crate::model::{ArchiveSource, FileStatus, NewFileRequest, RequestStatus, RequestType};
    use crate::packaging::aggregator::{Aggregator, PackagingPolicy};
    use chrono::{Duration, Utc};
    use crate::packaging::sqlite_store::SqlitePackageStore;
    use crate::packaging::PackageStore;
    use crate::service::archive_service::ArchiveService;
    use crate::service::dispatch::RequestDispatcher;
    use crate::service::result_service::ResultService;
    use std::sync::Arc;

    /// Accepts every file but never reports an outcome.
    struct SilentStore;

    impl BackendAdapter for SilentStore {
        fn name(&self) -> &str {
            "silent"
        }

        fn store(&self, file: &WorkingFile) -> Result<String> {
            Ok(format!("silent://{}", file.checksum))
        }

        fn store_package(&self, _contents: &PackageContents) -> Result<String> {
            Err(EngineError::backend("silent", "no packages here"))
        }

        fn delete(&self, _checksum: &str, _storage: &str) -> Result<()> {
            Ok(())
        }

        fn restore(&self, file: &WorkingFile) -> Result<String> {
            Ok(format!("silent://cache/{}", file.checksum))
        }

        fn execute(&self, _subset: &WorkingSubset) -> Vec<FileOutcome> {
            Vec::new()
        }
    }

    fn definition(name: &str, packaging: bool) -> StorageDefinition {
        StorageDefinition {
            name: name.to_string(),
            kind: BackendKind::Mock,
            base_path: "/archive".to_string(),
            packaging,
            archive_parent_url: Some(format!("https://archive.example/{}", name)),
            subset_size: 10,
            origin_root: None,
        }
    }

    fn store_request(checksum: &str, storage: &str) -> NewFileRequest {
        NewFileRequest {
            request_type: RequestType::Store,
            checksum: checksum.to_string(),
            algorithm: "MD5".to_string(),
            storage: storage.to_string(),
            sub_directory: None,
            origin_url: Some(format!("file:///incoming/{}", checksum)),
            file_name: None,
            file_size: 250,
            owner: Some("alice".to_string()),
            session_owner: None,
            session: None,
        }
    }

    struct Setup {
        db: Arc<Database>,
        ledger: Arc<SqliteLedger>,
        packages: Arc<SqlitePackageStore>,
        dispatcher: RequestDispatcher,
    }

    fn setup(backends: BackendRegistry) -> Setup {
        let db = Arc::new(Database::open_in_memory().expect("Failed to open database"));
        let ledger = Arc::new(SqliteLedger::new(db.clone()));
        let packages = Arc::new(SqlitePackageStore::new(db.clone()));
        let results = Arc::new(ResultService::new(ledger.clone(), ledger.clone()));
        let dispatcher = RequestDispatcher::new(ledger.clone(), packages.clone(), Arc::new(backends), results, 10);
        Setup {
            db,
            ledger,
            packages,
            dispatcher,
        }
    }

    #[test]
    fn test_missing_backend_outcome_fails_the_request() {
        let mut backends = BackendRegistry::new();
        backends.register(definition("silent", false), Arc::new(SilentStore));
        let s = setup(backends);
        let id = s.ledger.submit(store_request("aaa", "silent"), None).unwrap().id();

        let report = s.dispatcher.dispatch(RequestType::Store).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 0);

        let request = s.ledger.find(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Error);
        assert!(request.error_cause.unwrap().contains("no outcome"));
    }

    #[test]
    fn test_unknown_storage_fails_at_dispatch() {
        let s = setup(BackendRegistry::new());
        let id = s.ledger.submit(store_request("aaa", "gone"), None).unwrap().id();

        let report = s.dispatcher.dispatch_all().unwrap();
        assert_eq!(report.failed, 1);
        let request = s.ledger.find(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Error);
        assert_eq!(request.error_cause.as_deref(), Some("unknown storage gone"));
    }

    #[test]
    fn test_store_on_packaging_storage_waits_for_a_package() {
        let tape = definition("tape", true);
        let mut backends = BackendRegistry::new();
        backends.register(tape.clone(), Arc::new(MockStore::new(&tape)));
        let s = setup(backends);
        let id = s.ledger.submit(store_request("aaa", "tape"), None).unwrap().id();

        let report = s.dispatcher.dispatch(RequestType::Store).unwrap();
        assert_eq!(report.packaged, 1);

        let request = s.ledger.find(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(s.packages.find_file_by_request(ArchiveSource::External, id).unwrap().is_none());
        let waiting = s.packages.find_file_by_request(ArchiveSource::Ledger, id).unwrap().unwrap();
        assert_eq!(waiting.status, FileStatus::WaitingPackage);
        // file name defaults to the checksum
        assert_eq!(waiting.filename, "aaa");
        assert_eq!(waiting.size, 250);
        assert_eq!(waiting.final_archive_parent_url, tape.parent_url_for(""));

        // handed over, not interrupted
        assert_eq!(s.ledger.requeue_interrupted().unwrap(), 0);
        assert_eq!(s.dispatcher.dispatch(RequestType::Store).unwrap().packaged, 0);
    }

    #[test]
    fn test_archive_requests_from_the_bus() {
        let s = setup(BackendRegistry::new());
        let archives = Arc::new(ArchiveService::new(s.packages.clone(), Arc::new(BackendRegistry::new()), 10));
        let bus = InMemoryBus::new(8);
        bus.subscribe_batch(archives);

        let valid = FileArchiveRequestEvent {
            request_id: 1,
            storage: "tape".to_string(),
            checksum: "aaa".to_string(),
            file_name: "a.dat".to_string(),
            storage_subdirectory: "dir".to_string(),
            final_archive_parent_url: "https://archive.example/tape/dir".to_string(),
            final_archive_parent_path: "/archive/tape/dir".to_string(),
            file_size: 10,
            origin_url: None,
            source: ArchiveSource::Ledger,
        };
        let mut invalid = valid.clone();
        invalid.request_id = 2;
        invalid.checksum = String::new();

        bus.publish_batch(vec![
            BusEvent::FileArchiveRequest(valid.clone()),
            BusEvent::FileArchiveRequest(invalid),
        ])
        .unwrap();
        // redelivery is harmless
        bus.publish_batch(vec![BusEvent::FileArchiveRequest(valid)]).unwrap();

        // whatever the event claims, bus requests are external
        let waiting = s.packages.find_file_by_request(ArchiveSource::External, 1).unwrap().unwrap();
        assert_eq!(waiting.status, FileStatus::WaitingPackage);
        assert!(s.packages.find_file_by_request(ArchiveSource::Ledger, 1).unwrap().is_none());
        assert!(s.packages.find_file_by_request(ArchiveSource::External, 2).unwrap().is_none());

        // the invalid request is answered with a failure
        let outbox = Outbox::new(s.db.clone(), Arc::new(InMemoryBus::new(8)), 10);
        assert_eq!(outbox.pending().unwrap(), 1);
    }

    #[test]
    fn test_external_answers_never_touch_the_ledger() {
        let s = setup(BackendRegistry::new());
        let id = s.ledger.submit(store_request("aaa", "tape"), None).unwrap().id();
        s.ledger.mark_pending(&[id]).unwrap();
        let results = ResultService::new(s.ledger.clone(), s.ledger.clone());

        results
            .handle_batch(&[
                BusEvent::FileArchiveResponse(FileArchiveResponseEvent::success(id, "https://other/x.zip".into())),
                BusEvent::FileArchiveResponse(FileArchiveResponseEvent::failure(id, "not mine")),
            ])
            .unwrap();
        assert_eq!(s.ledger.find(id).unwrap().unwrap().status, RequestStatus::Pending);

        results
            .handle_batch(&[BusEvent::FileArchiveResponse(
                FileArchiveResponseEvent::success(id, "https://archive.example/tape/p.zip".into())
                    .with_source(ArchiveSource::Ledger),
            )])
            .unwrap();
        // completed and removed
        assert!(s.ledger.find(id).unwrap().is_none());
    }

    #[test]
    fn test_retry_reopens_a_failed_waiting_file() {
        let tape = definition("tape", true);
        let mut backends = BackendRegistry::new();
        backends.register(tape.clone(), Arc::new(MockStore::new(&tape)));
        let s = setup(backends);
        let aggregator = Aggregator::new(
            s.packages.clone(),
            PackagingPolicy {
                max_size_bytes: 1000,
                max_age: Duration::hours(12),
            },
            10,
        );
        let id = s.ledger.submit(store_request("aaa", "tape"), None).unwrap().id();
        s.dispatcher.dispatch(RequestType::Store).unwrap();
        aggregator.run_pass(Utc::now()).unwrap();
        let bound = s.packages.find_file_by_request(ArchiveSource::Ledger, id).unwrap().unwrap();
        s.packages.mark_package_error(bound.package_id.unwrap(), "tape offline").unwrap();
        s.ledger.mark_error(id, "tape offline").unwrap();

        assert_eq!(s.ledger.retry_errors(RequestType::Store, None).unwrap(), 1);
        let report = s.dispatcher.dispatch(RequestType::Store).unwrap();
        assert_eq!(report.packaged, 1);
        assert_eq!(s.ledger.find(id).unwrap().unwrap().status, RequestStatus::Pending);
        let reopened = s.packages.find_file_by_request(ArchiveSource::Ledger, id).unwrap().unwrap();
        assert_eq!(reopened.status, FileStatus::WaitingPackage);
        assert_eq!(reopened.package_id, None);
        assert_eq!(aggregator.run_pass(Utc::now()).unwrap().bound, 1);
    }

    #[test]
    fn test_unsafe_subdirectory_fails_at_dispatch() {
        let tape = definition("tape", true);
        let mut backends = BackendRegistry::new();
        backends.register(tape.clone(), Arc::new(MockStore::new(&tape)));
        let s = setup(backends);
        let mut request = store_request("aaa", "tape");
        request.sub_directory = Some("../../outside".to_string());
        let id = s.ledger.submit(request, None).unwrap().id();

        let report = s.dispatcher.dispatch(RequestType::Store).unwrap();
        assert_eq!(report.failed, 1);
        let row = s.ledger.find(id).unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Error);
        assert!(row.error_cause.unwrap().contains("unsafe path component"));
        assert!(s.packages.find_file_by_request(ArchiveSource::Ledger, id).unwrap().is_none());
    }
}

