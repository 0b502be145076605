// tests/orchestrator.rs

//! Depot task queues: uploads under a transfer slot, installs through the
//! configuration service, and skipping installs after a failed upload.

mod common;

use common::{pseudo_random, write_file, RecordingBackend};
use httpmock::prelude::*;
use opsi_package_updater::orchestrator::{
    DepotConnection, DepotTaskExecutor, Task, TaskOrchestrator, TaskStatus,
};
use opsi_package_updater::repository::{HttpSession, SessionSettings};
use opsi_package_updater::Error;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const PACKAGE: &str = "hwaudit_4.2.0.0-1.opsi";

fn connection(backend: &Arc<RecordingBackend>, server: &MockServer, depot: &str) -> DepotConnection {
    DepotConnection {
        backend: backend.clone(),
        repository_url: Some(server.url(format!("/{depot}/repository"))),
        repository_local_url: Some("file:///var/lib/opsi/repository/".to_string()),
        session: HttpSession::new(&SessionSettings::default()).unwrap(),
    }
}

#[test]
fn test_failed_upload_skips_install() {
    let server = MockServer::start();
    let work = tempdir().unwrap();
    let package = write_file(work.path().join(PACKAGE), &pseudo_random(4096, 3));

    let rejected = server.mock(|when, then| {
        when.method(PUT).path(format!("/depot1/repository/{PACKAGE}"));
        then.status(507);
    });
    let accepted = server.mock(|when, then| {
        when.method(PUT).path(format!("/depot2/repository/{PACKAGE}"));
        then.status(201);
    });

    let depot1 = Arc::new(RecordingBackend::new());
    let depot2 = Arc::new(RecordingBackend::new());
    let mut executor = DepotTaskExecutor::new("config.example.org");
    executor.add_depot("depot1", connection(&depot1, &server, "depot1"));
    executor.add_depot("depot2", connection(&depot2, &server, "depot2"));

    let mut orchestrator = TaskOrchestrator::new(1).with_pause(Duration::ZERO);
    for depot in ["depot1", "depot2"] {
        orchestrator.add_task(Task::upload(depot, &package));
        orchestrator.add_task(Task::install(depot, &package));
    }

    let err = orchestrator.run(&executor).unwrap_err();
    match err {
        Error::TaskQueues { count, failures } => {
            assert_eq!(count, 1);
            assert!(failures[0].task.contains("depot1"));
        }
        other => panic!("expected task queue failures, got {other}"),
    }
    rejected.assert();
    accepted.assert();

    let queues = orchestrator.queues();
    assert_eq!(queues.len(), 2);
    let statuses = |depot: &str| -> Vec<TaskStatus> {
        queues
            .iter()
            .find(|q| q.depot_id() == depot)
            .unwrap()
            .tasks()
            .iter()
            .map(|t| t.status.clone())
            .collect()
    };
    assert!(matches!(
        statuses("depot1").as_slice(),
        [TaskStatus::Failed(_), TaskStatus::Skipped]
    ));
    assert_eq!(statuses("depot2"), vec![TaskStatus::Succeeded, TaskStatus::Succeeded]);

    // The slot is released even though the upload failed
    assert_eq!(
        depot1.calls(),
        vec![
            "acquire_transfer_slot depot1 config.example.org -".to_string(),
            "release_transfer_slot depot1 config.example.org slot-1".to_string(),
        ]
    );
    assert_eq!(depot2.calls_to("install_package"), vec![format!("install_package {PACKAGE}")]);
    // The depot installs the uploaded copy with its current property values
    assert_eq!(
        depot2.install_paths(),
        vec![std::path::PathBuf::from(format!("/var/lib/opsi/repository/{PACKAGE}"))]
    );
    assert_eq!(
        depot2.calls_to("product_property_defaults"),
        vec!["product_property_defaults hwaudit depot2".to_string()]
    );
}

#[test]
fn test_uninstall_runs_without_slot() {
    let server = MockServer::start();
    let backend = Arc::new(RecordingBackend::new());
    let mut executor = DepotTaskExecutor::new("config.example.org");
    executor.add_depot("depot1", connection(&backend, &server, "depot1"));

    let mut orchestrator = TaskOrchestrator::new(0).with_pause(Duration::ZERO);
    orchestrator.add_task(Task::uninstall("depot1", "hwaudit"));
    orchestrator.run(&executor).unwrap();

    assert_eq!(backend.calls(), vec!["uninstall_package depot1 hwaudit".to_string()]);
}

#[test]
fn test_slot_without_retention_is_released() {
    let server = MockServer::start();
    let work = tempdir().unwrap();
    let package = write_file(work.path().join(PACKAGE), b"package");
    let upload = server.mock(|when, then| {
        when.method(PUT).path(format!("/depot1/repository/{PACKAGE}"));
        then.status(201);
    });

    let mut backend = RecordingBackend::new();
    backend.retention = None;
    let backend = Arc::new(backend);
    let mut executor = DepotTaskExecutor::new("config.example.org");
    executor.add_depot("depot1", connection(&backend, &server, "depot1"));

    let mut orchestrator = TaskOrchestrator::new(1).with_pause(Duration::ZERO);
    orchestrator.add_task(Task::upload("depot1", &package));
    assert!(orchestrator.run(&executor).is_err());

    upload.assert_hits(0);
    assert_eq!(backend.calls_to("release_transfer_slot").len(), 1);
}
