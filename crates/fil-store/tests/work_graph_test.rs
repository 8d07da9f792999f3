//! Cross-module scenarios: the dependency graph, claims and events
//! working together.

use std::sync::Arc;

use fil_bus::{topics, EventBus, EventFilter};
use fil_core::types::{BeadStatus, BeadType};
use fil_store::{
    BeadFilter, BeadStore, ClaimCoordinator, DecisionManager, NewBead, ReleaseOutcome,
};

async fn setup() -> (EventBus, Arc<BeadStore>, ClaimCoordinator, uuid::Uuid) {
    let bus = EventBus::default();
    let store = Arc::new(BeadStore::new(bus.clone()));
    let decisions = Arc::new(DecisionManager::new(bus.clone()));
    let coordinator = ClaimCoordinator::new(Arc::clone(&store), decisions, bus.clone());
    let project = store.create_project("graph").await;
    (bus, store, coordinator, project.id)
}

#[tokio::test]
async fn dependency_unblock_publishes_completion() {
    let (bus, store, coordinator, project) = setup().await;
    let completed = bus.subscribe(EventFilter::for_type(topics::BEAD_COMPLETED));

    let a = store
        .create(NewBead::new("a", BeadType::Task, project))
        .await
        .unwrap();
    let mut nb = NewBead::new("b", BeadType::Task, project);
    nb.blocked_by.insert(a.id);
    let b = store.create(nb).await.unwrap();

    // ready-set(P) = {A}
    let ready: Vec<_> = store
        .ready_set(project)
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ready, vec![a.id]);

    let agent = uuid::Uuid::new_v4();
    coordinator.claim(a.id, agent).await.unwrap();
    coordinator.begin(a.id, agent).await.unwrap();
    coordinator
        .release(a.id, agent, ReleaseOutcome::Done)
        .await
        .unwrap();

    // ready-set(P) = {B} and bead.completed carried A's id.
    let ready: Vec<_> = store
        .ready_set(project)
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ready, vec![b.id]);

    let event = completed.receiver.recv().unwrap();
    assert_eq!(event.data["bead_id"], serde_json::json!(a.id));
    assert_eq!(event.project_id, Some(project));
}

#[tokio::test]
async fn chain_unblocks_in_order() {
    let (_bus, store, coordinator, project) = setup().await;

    let a = store
        .create(NewBead::new("a", BeadType::Task, project))
        .await
        .unwrap();
    let mut nb = NewBead::new("b", BeadType::Task, project);
    nb.blocked_by.insert(a.id);
    let b = store.create(nb).await.unwrap();
    let mut nc = NewBead::new("c", BeadType::Task, project);
    nc.blocked_by.insert(a.id);
    nc.blocked_by.insert(b.id);
    let c = store.create(nc).await.unwrap();

    let agent = uuid::Uuid::new_v4();
    coordinator.claim(a.id, agent).await.unwrap();
    coordinator.begin(a.id, agent).await.unwrap();
    coordinator
        .release(a.id, agent, ReleaseOutcome::Done)
        .await
        .unwrap();

    // C still waits on B.
    let ready: Vec<_> = store
        .ready_set(project)
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ready, vec![b.id]);

    coordinator.claim(b.id, agent).await.unwrap();
    coordinator.begin(b.id, agent).await.unwrap();
    coordinator
        .release(b.id, agent, ReleaseOutcome::Done)
        .await
        .unwrap();

    let ready: Vec<_> = store
        .ready_set(project)
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ready, vec![c.id]);
}

#[tokio::test]
async fn failed_release_keeps_dependents_blocked() {
    let (_bus, store, coordinator, project) = setup().await;

    let a = store
        .create(NewBead::new("a", BeadType::Task, project))
        .await
        .unwrap();
    let mut nb = NewBead::new("b", BeadType::Task, project);
    nb.blocked_by.insert(a.id);
    let b = store.create(nb).await.unwrap();

    let agent = uuid::Uuid::new_v4();
    coordinator.claim(a.id, agent).await.unwrap();
    coordinator
        .release(a.id, agent, ReleaseOutcome::Failed)
        .await
        .unwrap();

    // A is open again; B remains blocked.
    assert_eq!(store.get(a.id).await.unwrap().status, BeadStatus::Open);
    let ready: Vec<_> = store
        .ready_set(project)
        .await
        .unwrap()
        .iter()
        .map(|x| x.id)
        .collect();
    assert_eq!(ready, vec![a.id]);
    assert!(!ready.contains(&b.id));
}

#[tokio::test]
async fn bulk_update_tags_matching_beads() {
    let (_bus, store, _coordinator, project) = setup().await;
    for i in 0..3 {
        let mut nb = NewBead::new(format!("bug {i}"), BeadType::Bug, project);
        nb.priority = 1;
        store.create(nb).await.unwrap();
    }
    store
        .create(NewBead::new("task", BeadType::Task, project))
        .await
        .unwrap();

    let filter = BeadFilter {
        project_id: Some(project),
        bead_type: Some(BeadType::Bug),
        ..Default::default()
    };
    let patch = fil_store::BeadPatch {
        tags: Some(["triaged".to_string()].into_iter().collect()),
        ..Default::default()
    };
    let updated = store.bulk_update(&filter, patch).await;
    assert_eq!(updated.len(), 3);
    assert!(updated.iter().all(|b| b.tags.contains("triaged")));
}
