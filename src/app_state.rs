//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use chrono::Duration;
use log::info;
use std::sync::Arc;

use crate::backend::mock_store::MockStore;
use crate::backend::BackendRegistry;
use crate::bus::memory::InMemoryBus;
use crate::bus::outbox::Outbox;
use crate::bus::MessageBus;
use crate::config::{AppConfig, BackendKind, StorageDefinition};
use crate::database::Database;
use crate::error::Result;
use crate::ledger::sqlite_store::SqliteLedger;
use crate::packaging::aggregator::{Aggregator, PackagingPolicy};
use crate::packaging::sqlite_store::SqlitePackageStore;
use crate::scheduler::lease::{unique_owner, Lease};
use crate::scheduler::{Scheduler, LEASE_NAME};
use crate::service::archive_service::ArchiveService;
use crate::service::dispatch::RequestDispatcher;
use crate::service::request_service::RequestService;
use crate::service::result_service::ResultService;

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub bus: Arc<InMemoryBus>,
    pub backends: Arc<BackendRegistry>,
    pub request_service: Arc<RequestService>,
    pub result_service: Arc<ResultService>,
    pub archive_service: Arc<ArchiveService>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> Result<Self> {
        info!("Initializing application state with configuration");
        let db = Arc::new(Database::open(&config.database)?);
        let backends = BackendRegistry::from_config(&config.storages)?;
        Self::assemble(config, db, backends)
    }

    /// Wire every service around an opened database and a backend registry.
    pub fn assemble(config: AppConfig, db: Arc<Database>, backends: BackendRegistry) -> Result<Self> {
        let page_size = config.scheduler.page_size;
        let backends = Arc::new(backends);
        let bus = Arc::new(InMemoryBus::new(config.bus.capacity));

        let ledger = Arc::new(SqliteLedger::new(db.clone()));
        let packages = Arc::new(SqlitePackageStore::new(db.clone()));

        let request_service = Arc::new(RequestService::new(ledger.clone(), ledger.clone(), backends.clone()));
        let result_service = Arc::new(ResultService::new(ledger.clone(), ledger.clone()));
        let archive_service = Arc::new(ArchiveService::new(packages.clone(), backends.clone(), page_size));
        bus.subscribe_batch(archive_service.clone());
        bus.subscribe_batch(result_service.clone());

        let dispatcher = Arc::new(RequestDispatcher::new(
            ledger.clone(),
            packages.clone(),
            backends.clone(),
            result_service.clone(),
            page_size,
        ));
        let aggregator = Arc::new(Aggregator::new(
            packages,
            PackagingPolicy::from_config(&config.archive),
            page_size,
        ));
        let outbox = Arc::new(Outbox::new(db.clone(), bus.clone(), page_size));
        let lease = Lease::new(
            db.clone(),
            LEASE_NAME,
            unique_owner("engine"),
            Duration::seconds(config.scheduler.lease_ttl_secs as i64),
        );
        let scheduler = Arc::new(Scheduler::new(
            ledger,
            dispatcher,
            aggregator,
            archive_service.clone(),
            result_service.clone(),
            outbox,
            lease,
            config.requests.expiration(),
            &config.scheduler,
        ));

        info!(
            "Application state initialized with storages {:?}",
            backends.storages()
        );
        Ok(Self {
            config,
            db,
            bus,
            backends,
            request_service,
            result_service,
            archive_service,
            scheduler,
        })
    }

    /// Create application state for testing: in-memory database, a plain
    /// `disk` storage and a packaging `tape` storage, both mocked.
    pub fn new_for_testing() -> Result<Self> {
        let mut config = AppConfig::default();
        config.scheduler.enabled = false;
        config.storages = vec![
            mock_definition("disk", false),
            mock_definition("tape", true),
        ];
        let mut backends = BackendRegistry::new();
        for definition in &config.storages {
            backends.register(definition.clone(), Arc::new(MockStore::new(definition)));
        }
        let db = Arc::new(Database::open_in_memory()?);
        Self::assemble(config, db, backends)
    }
}

fn mock_definition(name: &str, packaging: bool) -> StorageDefinition {
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
