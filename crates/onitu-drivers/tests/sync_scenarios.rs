//! End-to-end synchronization scenarios
//!
//! Runs real drivers, a real referee, and a real broker in one process
//! against an in-memory metadata store: local drivers with their notify
//! watchers, the playground driver with its poll intake, and the fabric in
//! between. Each test builds its own little cluster.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use onitu_core::config::Setup;
use onitu_core::{DriverName, Fid, FileRecord};
use onitu_drivers::playground::{PlaygroundOptions, PlaygroundStore};
use onitu_fabric::{Command, Dealer, FabricError};
use onitu_plug::Plug;
use onitu_referee::{Broker, Referee};
use onitu_store::{keys, Store};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Cluster {
    store: Store,
    setup: Setup,
    plugs: Vec<Plug>,
    referee: Arc<Referee>,
    broker: Arc<Broker>,
}

async fn start_cluster(setup_yaml: &str) -> Cluster {
    let store = Store::open_in_memory().await.unwrap();
    let setup = Setup::parse(setup_yaml).unwrap();

    let referee = Referee::new(store.clone(), setup.rule_set().unwrap());
    tokio::spawn(referee.clone().listen());
    let broker = Broker::new(store.clone());
    tokio::spawn(broker.clone().listen());

    wait_for_key(&store, keys::REFEREE_PORT).await;
    wait_for_key(&store, keys::BROKER_PORT).await;

    Cluster {
        store,
        setup,
        plugs: Vec::new(),
        referee,
        broker,
    }
}

impl Cluster {
    async fn start_local(&mut self, name: &str) -> Plug {
        let service = self.setup.service(name).unwrap().clone();
        let plug = Plug::new(
            self.store.clone(),
            DriverName::new(name).unwrap(),
            self.setup.rule_set().unwrap(),
            service.folders.clone(),
        );
        let task_plug = plug.clone();
        tokio::spawn(async move {
            let _ = onitu_drivers::local::start(task_plug, &service).await;
        });
        self.wait_router(name).await;
        self.plugs.push(plug.clone());
        plug
    }

    async fn start_playground(
        &mut self,
        name: &str,
        pg_store: Arc<PlaygroundStore>,
        options: PlaygroundOptions,
    ) -> Plug {
        let service = self.setup.service(name).unwrap().clone();
        let plug = Plug::new(
            self.store.clone(),
            DriverName::new(name).unwrap(),
            self.setup.rule_set().unwrap(),
            service.folders.clone(),
        );
        let task_plug = plug.clone();
        tokio::spawn(async move {
            let _ = onitu_drivers::playground::start_with_store(task_plug, pg_store, options).await;
        });
        self.wait_router(name).await;
        self.plugs.push(plug.clone());
        plug
    }

    async fn wait_router(&self, name: &str) {
        let key = keys::router(&DriverName::new(name).unwrap());
        wait_for_key(&self.store, &key).await;
    }

    fn shutdown(&self) {
        for plug in &self.plugs {
            plug.shutdown();
        }
        self.referee.shutdown();
        self.broker.shutdown();
    }
}

async fn wait_for_key(store: &Store, key: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !store.exists(key).await.unwrap_or(false) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for store key '{key}'"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn file_digest(path: &Path) -> Option<[u8; 32]> {
    std::fs::read(path).ok().map(|data| digest(&data))
}

/// Deterministic pseudo-random content.
fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}

fn two_local_setup(rep1: &Path, rep2: &Path) -> String {
    format!(
        r#"
services:
  rep1:
    driver: local
    options:
      root: {}
    folders:
      sync: ""
  rep2:
    driver: local
    options:
      root: {}
    folders:
      sync: ""
rules:
  - match: "**"
    sync: [rep1, rep2]
"#,
        rep1.display(),
        rep2.display()
    )
}

fn local_and_playground_setup(rep1: &Path) -> String {
    format!(
        r#"
services:
  rep1:
    driver: local
    options:
      root: {}
    folders:
      sync: ""
  pg:
    driver: playground
    options:
      root: ""
      changes_timer: 1
      access_key: k
      access_secret: s
    folders:
      sync: ""
rules:
  - match: "**"
    sync: [rep1, pg]
"#,
        rep1.display()
    )
}

fn pg_options() -> PlaygroundOptions {
    PlaygroundOptions {
        root: String::new(),
        changes_timer: 1,
        access_key: "k".into(),
        access_secret: "s".into(),
    }
}

// ---------------------------------------------------------------------------
// Scenario: simple copy (plus size boundaries and the broker)
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_simple_copy_between_local_drivers() {
    let rep1 = TempDir::new().unwrap();
    let rep2 = TempDir::new().unwrap();
    let mut cluster = start_cluster(&two_local_setup(rep1.path(), rep2.path())).await;
    cluster.start_local("rep1").await;
    cluster.start_local("rep2").await;

    const MIB: usize = 1024 * 1024;
    let cases: Vec<(&str, Vec<u8>)> = vec![
        ("doc.bin", content(MIB, 7)),            // exactly one chunk
        ("doc_plus_one.bin", content(MIB + 1, 9)), // one chunk + 1 byte
        ("empty.bin", Vec::new()),               // zero-length commit path
    ];

    for (name, data) in &cases {
        std::fs::write(rep1.path().join(name), data).unwrap();
    }

    for (name, data) in &cases {
        let expected = digest(data);
        let target: PathBuf = rep2.path().join(name);
        wait_until(
            &format!("'{name}' to appear on rep2 with matching digest"),
            Duration::from_secs(10),
            move || file_digest(&target) == Some(expected),
        )
        .await;
    }

    // Whole-file reads through the broker.
    let broker_port: u16 = cluster.store.get(keys::BROKER_PORT).await.unwrap().unwrap();
    let mut dealer = Dealer::connect_local(broker_port).await.unwrap();
    let fid = Fid::compute("sync", "doc.bin");
    let bytes = dealer
        .request_file(&Command::GetFile { fid })
        .await
        .unwrap();
    assert_eq!(digest(&bytes), digest(&cases[0].1));

    // Unknown fids answer with a 404-style error.
    let ghost = Fid::compute("sync", "nope.bin");
    let err = dealer
        .request_file(&Command::GetFile { fid: ghost })
        .await
        .unwrap_err();
    match err {
        FabricError::Remote(reason) => assert!(reason.starts_with("404"), "got: {reason}"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    cluster.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario: deletion propagation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_deletion_propagates_and_record_disappears() {
    let rep1 = TempDir::new().unwrap();
    let rep2 = TempDir::new().unwrap();
    let mut cluster = start_cluster(&two_local_setup(rep1.path(), rep2.path())).await;
    cluster.start_local("rep1").await;
    cluster.start_local("rep2").await;

    let data = content(64 * 1024, 3);
    std::fs::write(rep1.path().join("victim.bin"), &data).unwrap();

    let on_rep2 = rep2.path().join("victim.bin");
    let expected = digest(&data);
    {
        let on_rep2 = on_rep2.clone();
        wait_until("copy to settle on rep2", Duration::from_secs(10), move || {
            file_digest(&on_rep2) == Some(expected)
        })
        .await;
    }

    std::fs::remove_file(rep1.path().join("victim.bin")).unwrap();

    wait_until(
        "rep2 to stop exposing the file",
        Duration::from_secs(8),
        move || !on_rep2.exists(),
    )
    .await;

    // Once every owner confirmed, the record and its satellites are gone.
    let fid = Fid::compute("sync", "victim.bin");
    let store = cluster.store.clone();
    let record_key = keys::file(&fid);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !store.exists(&record_key).await.unwrap() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "record lingered after deletion"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    cluster.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario: case conflict on a case-insensitive backend
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_case_conflict_records_mapping_and_preserves_data() {
    let rep1 = TempDir::new().unwrap();
    let mut cluster = start_cluster(&local_and_playground_setup(rep1.path())).await;
    let pg_store = Arc::new(PlaygroundStore::new("k", "s"));
    cluster.start_local("rep1").await;
    cluster
        .start_playground("pg", pg_store.clone(), pg_options())
        .await;

    let first = content(2048, 1);
    std::fs::write(rep1.path().join("Foo.txt"), &first).unwrap();
    {
        let pg_store = pg_store.clone();
        let expected = digest(&first);
        wait_until("Foo.txt to reach the playground", Duration::from_secs(10), move || {
            pg_store
                .metadata("Foo.txt")
                .map(|o| digest(&o.data) == expected)
                .unwrap_or(false)
        })
        .await;
    }

    // A second file differing only in case cannot share the namespace.
    let second = content(2048, 2);
    std::fs::write(rep1.path().join("foo.txt"), &second).unwrap();
    {
        let pg_store = pg_store.clone();
        let expected = digest(&second);
        wait_until(
            "the conflicting file to land under the backend-assigned name",
            Duration::from_secs(10),
            move || {
                pg_store
                    .metadata("foo (1).txt")
                    .map(|o| digest(&o.data) == expected)
                    .unwrap_or(false)
            },
        )
        .await;
    }

    // The mapping is persisted and the original data survived.
    let conflict_key = keys::conflict(&DriverName::new("pg").unwrap(), "sync/foo.txt");
    let mapped: Option<String> = cluster.store.get(&conflict_key).await.unwrap();
    assert_eq!(mapped.as_deref(), Some("sync/foo (1).txt"));
    assert_eq!(
        digest(&pg_store.metadata("Foo.txt").unwrap().data),
        digest(&first)
    );

    cluster.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario: revision conflict converges
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_updates_converge_to_identical_digests() {
    let rep1 = TempDir::new().unwrap();
    let mut cluster = start_cluster(&local_and_playground_setup(rep1.path())).await;
    let pg_store = Arc::new(PlaygroundStore::new("k", "s"));
    cluster.start_local("rep1").await;
    cluster
        .start_playground("pg", pg_store.clone(), pg_options())
        .await;

    let v1 = content(4096, 5);
    std::fs::write(rep1.path().join("doc.txt"), &v1).unwrap();
    {
        let pg_store = pg_store.clone();
        let expected = digest(&v1);
        wait_until("initial sync to settle", Duration::from_secs(10), move || {
            pg_store
                .metadata("doc.txt")
                .map(|o| digest(&o.data) == expected)
                .unwrap_or(false)
        })
        .await;
    }

    // Both sides update concurrently: a direct remote edit bumps the
    // revision while rep1 writes different content.
    let remote_rev = pg_store.metadata("doc.txt").unwrap().rev;
    let (upload_id, _) = pg_store.chunk_upload(None, 0, &content(4096, 6)).unwrap();
    pg_store
        .commit("doc.txt", &upload_id, Some(&remote_rev))
        .unwrap();
    std::fs::write(rep1.path().join("doc.txt"), content(4096, 7)).unwrap();

    // Whoever wins, the system must converge: record settled, digests
    // identical on both drivers.
    let fid = Fid::compute("sync", "doc.txt");
    let store = cluster.store.clone();
    let record_key = keys::file(&fid);
    let rep1_path = rep1.path().join("doc.txt");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let record: Option<FileRecord> = store.get(&record_key).await.unwrap();
        if let Some(record) = record {
            let local = file_digest(&rep1_path);
            let remote = pg_store.metadata("doc.txt").map(|o| digest(&o.data));
            if record.is_settled()
                && record.uptodate.len() == 2
                && local.is_some()
                && local == remote
            {
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "drivers never converged after the revision conflict"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    cluster.shutdown();
}

// ---------------------------------------------------------------------------
// Scenario: cursor durability across driver restart
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_cursor_survives_restart_without_redundant_updates() {
    let rep1 = TempDir::new().unwrap();
    let mut cluster = start_cluster(&local_and_playground_setup(rep1.path())).await;
    let pg_store = Arc::new(PlaygroundStore::new("k", "s"));
    cluster.start_local("rep1").await;
    let pg_plug = cluster
        .start_playground("pg", pg_store.clone(), pg_options())
        .await;

    // A remote-side creation flows through poll intake to rep1.
    let data = content(8192, 11);
    let (upload_id, _) = pg_store.chunk_upload(None, 0, &data).unwrap();
    pg_store.commit("seed.txt", &upload_id, None).unwrap();

    let on_rep1 = rep1.path().join("seed.txt");
    let expected = digest(&data);
    {
        let on_rep1 = on_rep1.clone();
        wait_until("remote creation to reach rep1", Duration::from_secs(10), move || {
            file_digest(&on_rep1) == Some(expected)
        })
        .await;
    }

    let pg_name = DriverName::new("pg").unwrap();
    let cursor_key = keys::cursor(&pg_name);
    wait_for_key(&cluster.store, &cursor_key).await;
    let cursor_before: Option<String> = cluster.store.get(&cursor_key).await.unwrap();

    let fid = Fid::compute("sync", "seed.txt");
    let rep1_entry_key = keys::entry(&fid, &DriverName::new("rep1").unwrap());
    let rep1_extras_before = cluster.store.get_value(&rep1_entry_key).await.unwrap();

    // Restart the playground driver.
    pg_plug.shutdown();
    tokio::time::sleep(Duration::from_millis(300)).await;
    cluster
        .start_playground("pg", pg_store.clone(), pg_options())
        .await;

    // Give it several poll periods to (wrongly) re-emit anything.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let cursor_after: Option<String> = cluster.store.get(&cursor_key).await.unwrap();
    assert_eq!(cursor_after, cursor_before, "cursor must not move without changes");

    let rep1_extras_after = cluster.store.get_value(&rep1_entry_key).await.unwrap();
    assert_eq!(
        rep1_extras_after, rep1_extras_before,
        "a redundant update would have re-transferred and rewritten rep1's extras"
    );

    let record: FileRecord = cluster.store.get(&keys::file(&fid)).await.unwrap().unwrap();
    assert!(record.is_settled());
    assert_eq!(record.uptodate.len(), 2);

    cluster.shutdown();
}
