//! End-to-end tests for the state store: the save/list/active contract,
//! write durability across reopen, concurrent and cross-instance saves,
//! and the archive round trip.

use quorum_state::checksum::aggregate_checksum;
use quorum_state::{
    KanbanColumn, SaveOptions, StateStore, StoreOptions, WorkflowState, WorkflowStatus,
};
use tokio_util::sync::CancellationToken;

fn workflow(id: &str, prompt: &str) -> WorkflowState {
    let mut state = WorkflowState::new(id);
    state.title = format!("workflow {id}");
    state.prompt = prompt.to_string();
    state.status = WorkflowStatus::Running;
    state
}

#[tokio::test]
async fn first_save_lists_one_active_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).await.unwrap();
    let cancel = CancellationToken::new();

    store.save(&workflow("wf-1", "p"), &cancel).await.unwrap();

    let summaries = store.list_workflows().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].workflow_id, "wf-1");
    assert_eq!(summaries[0].prompt_excerpt, "p");
    assert!(summaries[0].is_active);

    assert_eq!(
        store.active_workflow_id().await.unwrap(),
        Some("wf-1".to_string())
    );
}

#[tokio::test]
async fn saved_state_survives_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let cancel = CancellationToken::new();

    {
        let store = StateStore::open(&db_path).await.unwrap();
        let mut state = workflow("wf-1", "persist me");
        state.tasks.insert(
            "t1".to_string(),
            quorum_state::TaskState {
                task_id: "t1".to_string(),
                name: "build".to_string(),
                ..quorum_state::TaskState::default()
            },
        );
        store.save(&state, &cancel).await.unwrap();
        store.close().await.unwrap();
    }

    let store = StateStore::open(&db_path).await.unwrap();
    let loaded = store.load().await.unwrap().expect("active workflow persisted");
    assert_eq!(loaded.workflow_id, "wf-1");
    assert_eq!(loaded.tasks.len(), 1);
    assert_eq!(aggregate_checksum(&loaded).unwrap(), loaded.checksum);
}

#[tokio::test]
async fn concurrent_saves_lose_no_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(
        StateStore::open(dir.path().join("state.db")).await.unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = std::sync::Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            store
                .save(&workflow(&format!("wf-{i}"), "concurrent"), &cancel)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let summaries = store.list_workflows().await.unwrap();
    let mut ids: Vec<_> = summaries.iter().map(|s| s.workflow_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn two_store_instances_share_one_database() {
    // Two stores on the same directory model two cooperating processes.
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let first = StateStore::open(&db_path).await.unwrap();
    let second = StateStore::open(&db_path).await.unwrap();

    let mut handles = Vec::new();
    for (idx, store) in [first, second].into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            for i in 0..10 {
                store
                    .save(
                        &workflow(&format!("wf-{idx}-{i}"), "cross instance"),
                        &cancel,
                    )
                    .await
                    .unwrap();
            }
            store
        }));
    }

    let mut stores = Vec::new();
    for handle in handles {
        stores.push(handle.await.unwrap());
    }

    let summaries = stores[0].list_workflows().await.unwrap();
    assert_eq!(summaries.len(), 20);

    // The global lock is exclusive across instances.
    stores[0].acquire_lock().await.unwrap();
    let err = stores[1].acquire_lock().await.unwrap_err();
    assert!(matches!(
        err,
        quorum_state::StateError::LockAcquireFailed(_)
    ));
    stores[0].release_lock().await.unwrap();
}

#[tokio::test]
async fn archive_round_trip_validates_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).await.unwrap();
    let cancel = CancellationToken::new();

    let opts = SaveOptions {
        set_as_active: false,
        ..SaveOptions::default()
    };
    for i in 0..3 {
        let mut state = workflow(&format!("wf-{i}"), "archive me");
        state.status = WorkflowStatus::Completed;
        state.kanban_column = KanbanColumn::Done;
        store.save_with(&state, opts, &cancel).await.unwrap();
    }

    assert_eq!(store.archive_workflows(&cancel).await.unwrap(), 3);
    assert!(store.list_workflows().await.unwrap().is_empty());

    for i in 0..3 {
        let path = store
            .state_dir()
            .join("archive")
            .join(format!("wf-{i}.json"));
        let bytes = std::fs::read(&path).unwrap();
        let envelope = quorum_state::envelope::StateEnvelope::from_slice(&bytes).unwrap();
        assert_eq!(envelope.state.workflow_id, format!("wf-{i}"));
        assert_eq!(envelope.state.status, WorkflowStatus::Completed);
    }
}

#[tokio::test]
async fn custom_options_are_honored() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = StateStore::with_options(
        StoreOptions::new(&db_path)
            .with_backup_path(dir.path().join("snapshots.bak"))
            .with_lock_ttl(std::time::Duration::from_secs(120))
            .with_max_retries(3),
    )
    .await
    .unwrap();
    let cancel = CancellationToken::new();

    store.save(&workflow("wf-1", "p"), &cancel).await.unwrap();
    let backup = store.backup(&cancel).await.unwrap();
    assert!(backup.ends_with("snapshots.bak"));
    assert!(backup.is_file());
}

#[tokio::test]
async fn cancellation_of_a_pending_save_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = store
        .save(&workflow("wf-1", "p"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, quorum_state::StateError::Cancelled { .. }));
    assert!(store.load_by_id("wf-1").await.unwrap().is_none());
}
