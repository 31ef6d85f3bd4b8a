use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use haunts_core::models::{
    CategoryType, EntityKind, NewDish, NewPlace, NewVisit, UpdatePlace,
};
use haunts_core::repo::lock;
use haunts_core::sync::{
    Connectivity, PassOutcome, RemoteApi, SessionProvider, SkipReason, SyncEngine, SyncReport,
};
use haunts_core::{BackendKind, Repository, SharedRepository};
use serde_json::Value;
use tokio::sync::{Notify, watch};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Create(EntityKind, Value),
    Update(EntityKind, String, Value),
}

#[derive(Default)]
struct MockRemote {
    calls: Mutex<Vec<Call>>,
    failing_names: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
}

impl MockRemote {
    fn fail_on(&self, name: &str) {
        self.failing_names.lock().unwrap().insert(name.to_string());
    }

    fn recover(&self) {
        self.failing_names.lock().unwrap().clear();
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self, payload: &Value) -> Result<()> {
        let name = payload["name"].as_str().unwrap_or_default();
        if self.failing_names.lock().unwrap().contains(name) {
            bail!("HTTP 500 for {name}");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<String> {
        self.check(payload)?;
        self.calls
            .lock()
            .unwrap()
            .push(Call::Create(kind, payload.clone()));
        Ok(format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn update(&self, kind: EntityKind, external_id: &str, payload: &Value) -> Result<()> {
        self.check(payload)?;
        self.calls.lock().unwrap().push(Call::Update(
            kind,
            external_id.to_string(),
            payload.clone(),
        ));
        Ok(())
    }
}

struct Flag(AtomicBool);

impl Flag {
    fn new(value: bool) -> Arc<Self> {
        Arc::new(Flag(AtomicBool::new(value)))
    }

    fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }
}

impl SessionProvider for Flag {
    fn is_authenticated(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connectivity for Flag {
    async fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A store whose seeded categories are already synced, so passes only
/// push what a test creates.
fn fresh_repo(kind: BackendKind) -> SharedRepository {
    let repo = Repository::open_in_memory(kind).unwrap();
    for category in repo.categories().list(Some(CategoryType::Place)).unwrap() {
        repo.categories()
            .mark_synced(&category.id, &format!("cat-{}", category.name), "t0")
            .unwrap();
    }
    repo.into_shared()
}

fn add_place(repo: &SharedRepository, name: &str) -> String {
    lock(repo)
        .places()
        .create(NewPlace {
            name: name.to_string(),
            ..NewPlace::default()
        })
        .unwrap()
        .id
}

fn engine(repo: &SharedRepository, remote: Arc<dyn RemoteApi>) -> SyncEngine {
    SyncEngine::new(repo.clone(), remote, Flag::new(true), Flag::new(true))
}

async fn completed(engine: &SyncEngine) -> SyncReport {
    match engine.run_pass().await.unwrap() {
        PassOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pass_creates_then_goes_quiet() {
    for kind in [BackendKind::Sqlite, BackendKind::Kv] {
        let repo = fresh_repo(kind);
        let remote = Arc::new(MockRemote::default());
        let engine = engine(&repo, remote.clone());
        let place_id = add_place(&repo, "Blue Door");

        let report = completed(&engine).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);

        let place = lock(&repo).places().get(&place_id).unwrap();
        assert!(!place.sync.dirty);
        assert_eq!(place.sync.external_id.as_deref(), Some("r1"));
        assert!(place.sync.last_synced_at.is_some());

        let report = completed(&engine).await;
        assert_eq!(report, SyncReport::default());
        assert_eq!(remote.calls().len(), 1, "{kind}");
    }
}

#[tokio::test]
async fn test_edited_record_is_updated_by_external_id() {
    let repo = fresh_repo(BackendKind::Sqlite);
    let remote = Arc::new(MockRemote::default());
    let engine = engine(&repo, remote.clone());
    let place_id = add_place(&repo, "Blue Door");
    completed(&engine).await;

    lock(&repo)
        .places()
        .update(
            &place_id,
            UpdatePlace {
                notes: Some(Some("now open late".to_string())),
                ..UpdatePlace::default()
            },
        )
        .unwrap();
    let report = completed(&engine).await;
    assert_eq!((report.created, report.updated), (0, 1));

    let calls = remote.calls();
    let Call::Update(kind, external_id, payload) = &calls[1] else {
        panic!("expected an update, got {:?}", calls[1]);
    };
    assert_eq!(*kind, EntityKind::Place);
    assert_eq!(external_id, "r1");
    assert_eq!(payload["notes"], "now open late");
}

#[tokio::test]
async fn test_one_failure_does_not_block_the_rest() {
    for kind in [BackendKind::Sqlite, BackendKind::Kv] {
        let repo = fresh_repo(kind);
        let remote = Arc::new(MockRemote::default());
        remote.fail_on("B");
        let engine = engine(&repo, remote.clone());
        let ids: Vec<String> = ["A", "B", "C"].iter().map(|n| add_place(&repo, n)).collect();

        let report = completed(&engine).await;
        assert_eq!(report.created, 2, "{kind}");
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].id, ids[1]);
        assert_eq!(report.failures[0].kind, EntityKind::Place);

        let dirty: Vec<bool> = ids
            .iter()
            .map(|id| lock(&repo).places().get(id).unwrap().sync.dirty)
            .collect();
        assert_eq!(dirty, vec![false, true, false]);

        remote.recover();
        let report = completed(&engine).await;
        assert_eq!((report.created, report.failed), (1, 0));
        assert!(!lock(&repo).places().get(&ids[1]).unwrap().sync.dirty);
    }
}

#[tokio::test]
async fn test_children_wait_for_their_parent() {
    let repo = fresh_repo(BackendKind::Kv);
    let remote = Arc::new(MockRemote::default());
    remote.fail_on("Shack");
    let engine = engine(&repo, remote.clone());

    let place_id = add_place(&repo, "Shack");
    let visit = lock(&repo)
        .visits()
        .create(NewVisit {
            place_id: place_id.clone(),
            ..NewVisit::default()
        })
        .unwrap();
    lock(&repo)
        .dishes()
        .create(NewDish {
            visit_id: visit.id.clone(),
            name: "Lobster roll".to_string(),
            rating: 5,
            ..NewDish::default()
        })
        .unwrap();

    let report = completed(&engine).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 2);
    assert!(remote.calls().is_empty());

    remote.recover();
    let report = completed(&engine).await;
    assert_eq!(report.created, 3);
    assert_eq!(report.deferred, 0);

    let calls = remote.calls();
    let kinds: Vec<EntityKind> = calls
        .iter()
        .map(|c| match c {
            Call::Create(kind, _) | Call::Update(kind, _, _) => *kind,
        })
        .collect();
    assert_eq!(kinds, vec![EntityKind::Place, EntityKind::Visit, EntityKind::Dish]);

    let place_ext = lock(&repo).external_id(EntityKind::Place, &place_id).unwrap();
    let Call::Create(_, visit_payload) = &calls[1] else {
        panic!("visit should have been created");
    };
    assert_eq!(visit_payload["placeExternalId"].as_str(), place_ext.as_deref());
    let Call::Create(_, dish_payload) = &calls[2] else {
        panic!("dish should have been created");
    };
    assert_eq!(dish_payload["visitExternalId"], "r2");
}

#[tokio::test]
async fn test_skips_without_session_or_connectivity() {
    let repo = fresh_repo(BackendKind::Sqlite);
    add_place(&repo, "Nowhere");
    let remote = Arc::new(MockRemote::default());
    let session = Flag::new(false);
    let link = Flag::new(true);
    let engine = SyncEngine::new(repo.clone(), remote.clone(), session.clone(), link.clone());

    assert_eq!(
        engine.run_pass().await.unwrap(),
        PassOutcome::Skipped(SkipReason::NotAuthenticated)
    );
    session.set(true);
    link.set(false);
    assert_eq!(
        engine.run_pass().await.unwrap(),
        PassOutcome::Skipped(SkipReason::Offline)
    );
    assert!(remote.calls().is_empty());
    assert!(!engine.is_running());
}

/// Edits the record it is asked to create, as a user would mid-push.
struct EditingRemote {
    repo: SharedRepository,
    inner: MockRemote,
}

#[async_trait]
impl RemoteApi for EditingRemote {
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<String> {
        let id = payload["id"].as_str().unwrap_or_default().to_string();
        tokio::time::sleep(Duration::from_millis(2)).await;
        lock(&self.repo).places().update(
            &id,
            UpdatePlace {
                notes: Some(Some("edited during push".to_string())),
                ..UpdatePlace::default()
            },
        )?;
        self.inner.create(kind, payload).await
    }

    async fn update(&self, kind: EntityKind, external_id: &str, payload: &Value) -> Result<()> {
        self.inner.update(kind, external_id, payload).await
    }
}

#[tokio::test]
async fn test_edit_during_push_is_not_lost() {
    let repo = fresh_repo(BackendKind::Sqlite);
    let remote = Arc::new(EditingRemote {
        repo: repo.clone(),
        inner: MockRemote::default(),
    });
    let engine = engine(&repo, remote.clone());
    let place_id = add_place(&repo, "Racy");

    let report = completed(&engine).await;
    assert_eq!((report.created, report.still_dirty), (1, 1));
    let place = lock(&repo).places().get(&place_id).unwrap();
    assert!(place.sync.dirty);
    assert_eq!(place.sync.external_id.as_deref(), Some("r1"));

    let report = completed(&engine).await;
    assert_eq!((report.created, report.updated, report.still_dirty), (0, 1, 0));
    let calls = remote.inner.calls();
    let Call::Update(_, external_id, payload) = &calls[1] else {
        panic!("second push should be an update");
    };
    assert_eq!(external_id, "r1");
    assert_eq!(payload["notes"], "edited during push");
    assert!(!lock(&repo).places().get(&place_id).unwrap().sync.dirty);
}

/// Blocks every create until released.
struct GatedRemote {
    entered: Notify,
    release: Notify,
    inner: MockRemote,
}

#[async_trait]
impl RemoteApi for GatedRemote {
    async fn create(&self, kind: EntityKind, payload: &Value) -> Result<String> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.create(kind, payload).await
    }

    async fn update(&self, kind: EntityKind, external_id: &str, payload: &Value) -> Result<()> {
        self.inner.update(kind, external_id, payload).await
    }
}

#[tokio::test]
async fn test_second_trigger_while_running_is_a_no_op() {
    let repo = fresh_repo(BackendKind::Kv);
    add_place(&repo, "Slow");
    let remote = Arc::new(GatedRemote {
        entered: Notify::new(),
        release: Notify::new(),
        inner: MockRemote::default(),
    });
    let engine = Arc::new(engine(&repo, remote.clone()));

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run_pass().await.unwrap() }
    });
    remote.entered.notified().await;
    assert!(engine.is_running());

    assert_eq!(engine.run_pass().await.unwrap(), PassOutcome::AlreadyRunning);

    remote.release.notify_one();
    let PassOutcome::Completed(report) = first.await.unwrap() else {
        panic!("first pass should complete");
    };
    assert_eq!(report.created, 1);
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_triggers() {
    let repo = fresh_repo(BackendKind::Sqlite);
    let remote = Arc::new(MockRemote::default());
    let engine = Arc::new(engine(&repo, remote.clone()).with_interval(Duration::from_secs(3600)));
    let (online_tx, online_rx) = watch::channel(true);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    add_place(&repo, "First");
    let handle = tokio::spawn(Arc::clone(&engine).run(online_rx, shutdown_rx));

    // Immediate pass at start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(remote.calls().len(), 1);

    // Coming back online triggers a pass well before the next tick.
    add_place(&repo, "Second");
    online_tx.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(remote.calls().len(), 1);
    online_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(remote.calls().len(), 2);

    // The timer fires after the interval.
    add_place(&repo, "Third");
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(remote.calls().len(), 3);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
