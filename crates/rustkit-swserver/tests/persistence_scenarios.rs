//! Persistence scenarios: import, held jobs, degraded stores, on-disk
//! registrations and data clearing.

mod common;

use common::*;
use rustkit_swserver::store::REGISTRATIONS_FILE;
use rustkit_swserver::{
    ChannelContext, JsonFileStore, MemoryStore, PersistenceStatus, RegistrationKey,
    RegistrationRecord, RegistrationStore, ResponsePolicyHeaders, SecurityOriginData,
    ServerNotice, ServiceWorkerError, ServiceWorkerState, SessionId, StoreError, SwServer,
    SwServerConfig, UpdateViaCache, WorkerRunState, WorkerType,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn record(scope: &str, script: &str) -> RegistrationRecord {
    RegistrationRecord {
        key: key(scope),
        update_via_cache: UpdateViaCache::default(),
        last_update_time: None,
        script_url: url(script),
        script: format!("// {}", script),
        policy: ResponsePolicyHeaders::default(),
        worker_type: WorkerType::Classic,
    }
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "rustkit-swserver-scenario-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Store whose reads or writes fail on demand.
struct FailingStore {
    fail_load: bool,
    fail_writes: bool,
    writes: Arc<AtomicUsize>,
}

impl RegistrationStore for FailingStore {
    fn load(&mut self) -> Result<Vec<RegistrationRecord>, StoreError> {
        if self.fail_load {
            return Err(StoreError::Unavailable("database is locked".into()));
        }
        Ok(Vec::new())
    }

    fn update_registration(&mut self, _record: RegistrationRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        Ok(())
    }

    fn remove_registration(&mut self, _key: &RegistrationKey) -> Result<(), StoreError> {
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[test]
fn test_jobs_are_held_until_import_completes() {
    let store = MemoryStore::with_records([record("/app/", "/app/sw.js")]);
    let mut harness = Harness::unimported(SwServerConfig::default(), Box::new(store));
    let mut client = harness.connect();

    let blog = harness.register(&mut client, "/blog/", "/blog/sw.js");
    let app = harness.register(&mut client, "/app/", "/app/sw.js");
    assert!(client.messages().is_empty());
    assert_eq!(harness.server.persistence_status(), PersistenceStatus::Importing);
    assert_eq!(harness.server.job_queue_count(), 0);

    harness.server.import_registrations();

    assert_eq!(
        drain(&mut harness.notices),
        vec![ServerNotice::ImportComplete { registrations: 1 }]
    );
    let messages = client.messages();
    assert!(fetch_requested(&messages, &blog));
    assert!(!fetch_requested(&messages, &app));
    let (restored, notify) = resolution(&messages, &app).unwrap();
    assert!(!notify);
    assert_eq!(
        restored.active.map(|w| w.state),
        Some(ServiceWorkerState::Activated)
    );
}

#[test]
fn test_restored_worker_starts_on_demand() {
    let store = MemoryStore::with_records([record("/app/", "/app/sw.js")]);
    let mut harness = Harness::unimported(SwServerConfig::default(), Box::new(store));
    harness.server.import_registrations();

    let registration = harness.server.registration(&key("/app/")).unwrap();
    let worker = registration.active().unwrap();
    assert_eq!(
        harness.server.worker(worker).map(|w| w.run_state()),
        Some(WorkerRunState::NotRunning)
    );
    assert!(harness.server.get_origins_with_registrations().contains(&origin()));

    harness
        .server
        .run_service_worker_if_necessary(worker, Box::new(|_running: bool| {}));
    let context = harness.expect_install_context();
    assert_eq!(context.script, "// /app/sw.js");
    harness.started(&context);
    assert!(harness.server.worker(worker).unwrap().is_running());
}

#[test]
fn test_unreadable_store_degrades_to_memory() {
    let writes = Arc::new(AtomicUsize::new(0));
    let store = FailingStore {
        fail_load: true,
        fail_writes: false,
        writes: writes.clone(),
    };
    let mut harness = Harness::unimported(SwServerConfig::default(), Box::new(store));
    harness.server.import_registrations();

    assert_eq!(harness.server.persistence_status(), PersistenceStatus::Degraded);
    assert!(harness.server.is_import_completed());
    let notices = drain(&mut harness.notices);
    assert!(matches!(
        notices.as_slice(),
        [
            ServerNotice::PersistenceUnavailable { .. },
            ServerNotice::ImportComplete { registrations: 0 }
        ]
    ));

    // Jobs still run; nothing is written.
    let mut client = harness.connect();
    harness.register_and_activate(&mut client, "/app/", "/app/sw.js");
    assert_eq!(harness.server.registration_count(), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_write_failure_is_reported_once() {
    let writes = Arc::new(AtomicUsize::new(0));
    let store = FailingStore {
        fail_load: false,
        fail_writes: true,
        writes: writes.clone(),
    };
    let mut harness = Harness::unimported(SwServerConfig::default(), Box::new(store));
    harness.server.import_registrations();
    let mut client = harness.connect();

    harness.register_and_activate(&mut client, "/app/", "/app/sw.js");
    harness.register_and_activate(&mut client, "/blog/", "/blog/sw.js");

    let unavailable = drain(&mut harness.notices)
        .into_iter()
        .filter(|notice| matches!(notice, ServerNotice::PersistenceUnavailable { .. }))
        .count();
    assert_eq!(unavailable, 1);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.server.persistence_status(), PersistenceStatus::Degraded);
    assert_eq!(harness.server.registration_count(), 2);
}

#[test]
fn test_registrations_survive_restart_on_disk() {
    let dir = temp_dir("restart");
    let config = SwServerConfig::default().with_registration_database_directory(&dir);
    let (context, engine) = ChannelContext::new();
    let (server, notices) = SwServer::from_config(SessionId::new(), config.clone(), Box::new(context));
    let mut harness = Harness {
        server,
        notices,
        engine,
    };
    harness.server.import_registrations();
    let mut client = harness.connect();
    harness.register_and_activate(&mut client, "/app/", "/app/sw.js");
    harness.register_and_activate(&mut client, "/blog/", "/blog/sw.js");
    harness.unregister(&mut client, "/blog/");

    let mut on_disk = JsonFileStore::new(&dir);
    let records = on_disk.load().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, key("/app/"));
    assert!(dir.join(REGISTRATIONS_FILE).exists());

    let mut restarted = Harness::unimported(config, Box::new(JsonFileStore::new(&dir)));
    restarted.server.import_registrations();
    let matched = restarted
        .server
        .match_registration(&origin(), &url("/app/index.html"))
        .unwrap();
    assert_eq!(matched.active.map(|w| w.script_url), Some(url("/app/sw.js")));
    assert!(restarted
        .server
        .match_registration(&origin(), &url("/blog/index.html"))
        .is_none());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_clear_origin_aborts_jobs_and_stops_workers() {
    let mut harness = Harness::new();
    let mut client = harness.connect();
    let (worker, _) = harness.register_and_activate(&mut client, "/app/", "/app/sw.js");
    let fetching = harness.register(&mut client, "/blog/", "/blog/sw.js");
    let queued = harness.register(&mut client, "/blog/", "/blog/v2.js");
    harness.commands();

    let unrelated =
        SecurityOriginData::from_url(&url::Url::parse("https://unrelated.example/").unwrap());
    harness.server.clear_origin(&unrelated);
    assert_eq!(harness.server.registration_count(), 2);

    harness.server.clear_origin(&origin());

    let messages = client.messages();
    assert!(matches!(
        rejection(&messages, &fetching),
        Some(ServiceWorkerError::Aborted(_))
    ));
    assert!(matches!(
        rejection(&messages, &queued),
        Some(ServiceWorkerError::Aborted(_))
    ));
    assert!(harness.server.worker(worker).is_none());
    assert_eq!(harness.server.registration_count(), 0);
    assert_eq!(harness.server.job_queue_count(), 0);
    assert!(harness.server.get_origins_with_registrations().is_empty());
}

#[test]
fn test_clear_all_empties_the_store() {
    let dir = temp_dir("clear");
    let mut harness = Harness::unimported(SwServerConfig::default(), Box::new(JsonFileStore::new(&dir)));
    harness.server.import_registrations();
    let mut client = harness.connect();
    let (worker, registration) = harness.register_and_activate(&mut client, "/app/", "/app/sw.js");
    harness.add_client(&mut client, "/app/page.html", Some(worker));
    harness.unregister(&mut client, "/app/");
    assert!(harness.server.registration_by_id(registration.id).is_some());

    harness.server.clear_all();

    assert!(harness.server.registration_by_id(registration.id).is_none());
    assert!(harness.server.worker(worker).is_none());
    assert!(JsonFileStore::new(&dir).load().unwrap().is_empty());

    // Still usable afterwards.
    let job = harness.register(&mut client, "/app/", "/app/sw.js");
    assert!(fetch_requested(&client.messages(), &job));

    let _ = std::fs::remove_dir_all(&dir);
}
