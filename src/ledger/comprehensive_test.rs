//! Comprehensive tests of the request and group ledgers

#[cfg(test)]
mod ledger_tests {
    use crate::bus::outbox::Outbox;
    use crate::bus::memory::InMemoryBus;
    use crate::database::Database;
    use crate::error::EngineError;
    use crate::ledger::sqlite_store::SqliteLedger;
    use crate::ledger::{GroupLedger, RequestLedger};
    use crate::model::{NewFileRequest, RequestStatus, RequestType, SubmitOutcome};
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use std::thread;

    fn store_request(checksum: &str, storage: &str, owner: &str) -> NewFileRequest {
        NewFileRequest {
            request_type: RequestType::Store,
            checksum: checksum.to_string(),
            algorithm: "MD5".to_string(),
            storage: storage.to_string(),
            sub_directory: Some("dir".to_string()),
            origin_url: Some(format!("file:///tmp/{}", checksum)),
            file_name: Some(format!("{}.dat", checksum)),
            file_size: 100,
            owner: Some(owner.to_string()),
            session_owner: Some(owner.to_string()),
            session: None,
        }
    }

    fn ledger() -> (Arc<Database>, SqliteLedger) {
        let db = Arc::new(Database::open_in_memory().expect("Failed to open database"));
        (db.clone(), SqliteLedger::new(db))
    }

    #[test]
    fn test_duplicate_submission_unions_owners_and_groups() {
        let (_db, ledger) = ledger();

        let first = ledger
            .submit_group("g1", RequestType::Store, vec![store_request("abc", "disk", "alice")])
            .expect("Failed to submit first group");
        let second = ledger
            .submit_group("g2", RequestType::Store, vec![store_request("abc", "disk", "bob")])
            .expect("Failed to submit second group");

        assert!(matches!(first[0], SubmitOutcome::Created(_)));
        assert_eq!(second[0], SubmitOutcome::Merged(first[0].id()));

        let row = ledger
            .find_by_key(RequestType::Store, "abc", "disk")
            .unwrap()
            .expect("Request should exist");
        assert_eq!(row.owners.iter().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(row.group_ids.iter().collect::<Vec<_>>(), vec!["g1", "g2"]);
        assert_eq!(row.status, RequestStatus::Todo);

        // same checksum on another storage is another request
        let other = ledger.submit(store_request("abc", "tape", "alice"), None).unwrap();
        assert!(matches!(other, SubmitOutcome::Created(_)));
        assert_ne!(other.id(), first[0].id());
    }

    #[test]
    fn test_duplicate_inside_one_group_counts_once() {
        let (_db, ledger) = ledger();
        let outcomes = ledger
            .submit_group(
                "g1",
                RequestType::Store,
                vec![store_request("abc", "disk", "alice"), store_request("abc", "disk", "bob")],
            )
            .unwrap();
        assert_eq!(outcomes[0].id(), outcomes[1].id());
        let group = ledger.find_group("g1").unwrap().expect("Group should exist");
        assert_eq!(group.expected, 1);
    }

    #[test]
    fn test_group_id_reuse_is_rejected() {
        let (_db, ledger) = ledger();
        ledger
            .submit_group("g1", RequestType::Store, vec![store_request("abc", "disk", "alice")])
            .unwrap();
        let again = ledger.submit_group("g1", RequestType::Store, vec![store_request("def", "disk", "alice")]);
        assert!(matches!(again, Err(EngineError::Validation(_))));
        // the rejected group left nothing behind
        assert!(ledger.find_by_key(RequestType::Store, "def", "disk").unwrap().is_none());
    }

    #[test]
    fn test_group_resolves_once_every_member_reported() {
        let (db, ledger) = ledger();
        let outcomes = ledger
            .submit_group(
                "g1",
                RequestType::Store,
                vec![store_request("abc", "disk", "alice"), store_request("def", "disk", "alice")],
            )
            .unwrap();
        let ids: Vec<i64> = outcomes.iter().map(SubmitOutcome::id).collect();
        assert_eq!(ledger.mark_pending(&ids).unwrap(), ids);

        ledger.complete(ids[0], Some("file:///disk/abc")).unwrap();
        assert!(ledger.take_resolved(10).unwrap().is_empty());

        ledger.mark_error(ids[1], "disk full").unwrap();
        let events = ledger.take_resolved(10).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.group_id, "g1");
        assert!(event.error);
        assert_eq!(event.results.len(), 2);
        let failed = event.results.iter().find(|r| r.error).expect("one failed result");
        assert_eq!(failed.request_checksum, "def");
        assert_eq!(failed.error_cause.as_deref(), Some("disk full"));

        assert!(ledger.find_group("g1").unwrap().is_none());
        assert!(ledger.take_resolved(10).unwrap().is_empty());

        let outbox = Outbox::new(db, Arc::new(InMemoryBus::new(4)), 10);
        assert_eq!(outbox.pending().unwrap(), 1);
    }

    #[test]
    fn test_mark_error_is_idempotent() {
        let (_db, ledger) = ledger();
        let id = ledger.submit(store_request("abc", "disk", "alice"), Some("g1")).unwrap().id();
        ledger.mark_pending(&[id]).unwrap();

        let first = ledger.mark_error(id, "timeout").unwrap().unwrap();
        let second = ledger.mark_error(id, "timeout again").unwrap().unwrap();
        assert_eq!(first.status, RequestStatus::Error);
        assert_eq!(second.error_cause.as_deref(), Some("timeout again"));
        assert!(ledger.mark_error(9999, "missing").unwrap().is_none());
    }

    #[test]
    fn test_remove_done_and_resubmit_creates_new_row() {
        let (_db, ledger) = ledger();
        let id = ledger.submit(store_request("abc", "disk", "alice"), None).unwrap().id();

        // only DONE rows are removed
        assert_eq!(ledger.remove_done(&[id]).unwrap(), 0);

        ledger.mark_pending(&[id]).unwrap();
        ledger.complete(id, None).unwrap();
        let again = ledger.submit(store_request("abc", "disk", "bob"), None).unwrap();
        assert!(matches!(again, SubmitOutcome::Created(_)));
        assert_ne!(again.id(), id);
        assert!(ledger.find(id).unwrap().is_none());

        let row = ledger.find(again.id()).unwrap().unwrap();
        assert_eq!(row.owners.len(), 1);
        assert!(row.owners.contains("bob"));
    }

    #[test]
    fn test_retry_and_resubmission_reset_errors() {
        let (_db, ledger) = ledger();
        let a = ledger.submit(store_request("abc", "disk", "alice"), None).unwrap().id();
        let b = ledger.submit(store_request("def", "tape", "alice"), None).unwrap().id();
        ledger.mark_error(a, "boom").unwrap();
        ledger.mark_error(b, "boom").unwrap();

        assert_eq!(ledger.retry_errors(RequestType::Store, Some("disk")).unwrap(), 1);
        let row = ledger.find(a).unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Todo);
        assert_eq!(row.error_cause, None);

        let merged = ledger.submit(store_request("def", "tape", "bob"), None).unwrap();
        assert_eq!(merged, SubmitOutcome::Merged(b));
        assert_eq!(ledger.find(b).unwrap().unwrap().status, RequestStatus::Todo);
    }

    #[test]
    fn test_delete_errors_only_touches_errors() {
        let (_db, ledger) = ledger();
        let a = ledger.submit(store_request("abc", "disk", "alice"), None).unwrap().id();
        let b = ledger.submit(store_request("def", "disk", "alice"), None).unwrap().id();
        ledger.mark_error(a, "boom").unwrap();

        assert_eq!(ledger.delete_errors(RequestType::Store, None).unwrap(), 1);
        assert!(ledger.find(a).unwrap().is_none());
        assert!(ledger.find(b).unwrap().is_some());
    }

    #[test]
    fn test_expiration_fails_stale_todo_requests() {
        let (_db, ledger) = ledger();
        let id = ledger.submit(store_request("abc", "disk", "alice"), Some("g")).unwrap().id();

        assert!(ledger.expire_older_than(Utc::now() - Duration::hours(1)).unwrap().is_empty());

        let expired = ledger.expire_older_than(Utc::now() + Duration::hours(1)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
        let row = ledger.find(id).unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Error);
        assert!(row.error_cause.unwrap().starts_with("request expired: not dispatched since"));
    }

    #[test]
    fn test_interrupted_dispatch_is_requeued() {
        let (_db, ledger) = ledger();
        let id = ledger.submit(store_request("abc", "disk", "alice"), None).unwrap().id();
        ledger.mark_pending(&[id]).unwrap();

        assert_eq!(ledger.requeue_interrupted().unwrap(), 1);
        assert_eq!(ledger.find(id).unwrap().unwrap().status, RequestStatus::Todo);
        assert_eq!(ledger.requeue_interrupted().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_identical_submissions_yield_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        Database::open_path(&path).expect("Failed to create database");

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let path = path.clone();
                thread::spawn(move || {
                    let ledger = SqliteLedger::new(Arc::new(Database::open_path(&path).unwrap()));
                    for _ in 0..10 {
                        ledger
                            .submit(store_request("abc", "disk", &format!("owner-{}", n)), Some(&format!("g{}", n)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ledger = SqliteLedger::new(Arc::new(Database::open_path(&path).unwrap()));
        let page = ledger.page_by_status(RequestType::Store, RequestStatus::Todo, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].owners.len(), 4);
        assert_eq!(page[0].group_ids.len(), 4);
    }
}
