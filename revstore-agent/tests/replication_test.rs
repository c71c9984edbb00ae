//! Replication and indexing across repositories driven by the agent manager

use revstore_agent::{AgentKind, AgentManager, AgentOptions, AgentState};
use revstore_core::{
    Catalog, ContentReader, Hash, MemoryIndex, Metadata, Operation, Repository, SearchIndex, Value,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;

fn setup(names: &[&str]) -> (Arc<Catalog>, AgentManager) {
    let catalog = Arc::new(Catalog::new());
    for name in names {
        catalog.insert(Arc::new(Repository::in_memory(*name)));
    }
    let manager = AgentManager::new(catalog.clone(), AgentOptions::default(), Handle::current());
    (catalog, manager)
}

fn bytes(data: &'static [u8]) -> ContentReader {
    Box::new(data)
}

fn meta(fields: &[(&str, Value)]) -> Metadata {
    fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

async fn read_all(repo: &Repository, content: Hash) -> Vec<u8> {
    let mut out = Vec::new();
    repo.open_content(content).await.unwrap().read_to_end(&mut out).await.unwrap();
    out
}

async fn heads(repo: &Repository, content: Hash) -> BTreeSet<Hash> {
    repo.revisions(content).await.unwrap().head_hashes()
}

#[tokio::test]
async fn test_replicates_content_and_revisions() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    assert!(manager.sync("a", "b").unwrap());
    assert!(!manager.sync("a", "b").unwrap());

    let r0 = a.add(bytes(b"hello replica"), meta(&[("msg", "hi".into())])).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;

    let content = r0.content();
    assert_eq!(read_all(&b, content).await, b"hello replica");
    assert_eq!(heads(&b, content).await, BTreeSet::from([r0.hash()]));
    let events = b.history(0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Operation::Create);
}

#[tokio::test]
async fn test_link_drains_existing_backlog() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();

    let mut contents = vec![];
    for i in 0..5i64 {
        let reader = Box::new(std::io::Cursor::new(format!("doc {}", i).into_bytes()));
        contents.push(a.add(reader, meta(&[("n", i.into())])).await.unwrap().content());
    }

    manager.sync("a", "b").unwrap();
    manager.wait_idle().await;

    for content in contents {
        assert!(b.has_content(content).await.unwrap());
    }
    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].processed, 5);
    assert_eq!(status[0].cursor, 5);
}

#[tokio::test]
async fn test_multi_hop_propagation() {
    let (catalog, manager) = setup(&["a", "b", "c"]);
    let a = catalog.get("a").unwrap();
    let c = catalog.get("c").unwrap();
    manager.sync("a", "b").unwrap();
    manager.sync("b", "c").unwrap();

    let r0 = a.add(bytes(b"travels far"), Metadata::new()).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;

    assert_eq!(read_all(&c, r0.content()).await, b"travels far");
    assert_eq!(heads(&c, r0.content()).await, BTreeSet::from([r0.hash()]));
}

#[tokio::test]
async fn test_bidirectional_links_converge() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    manager.sync("a", "b").unwrap();
    manager.sync("b", "a").unwrap();

    let r0 = a.add(bytes(b"shared"), meta(&[("msg", "base".into())])).await.unwrap();
    let content = r0.content();
    manager.signal("a");
    manager.wait_idle().await;
    assert_eq!(heads(&b, content).await, BTreeSet::from([r0.hash()]));

    // concurrent edits on both sides
    let base = BTreeSet::from([r0.hash()]);
    a.update(content, &base, meta(&[("msg", "base".into()), ("left", 1i64.into())])).await.unwrap();
    b.update(content, &base, meta(&[("msg", "base".into()), ("right", 2i64.into())])).await.unwrap();
    manager.signal("a");
    manager.signal("b");
    manager.wait_idle().await;

    let left = a.revisions(content).await.unwrap();
    let right = b.revisions(content).await.unwrap();
    assert_eq!(left.head_hashes(), right.head_hashes());
    assert_eq!(left.head_hashes().len(), 1);

    let merged = left.latest().unwrap();
    assert_eq!(merged.parents().len(), 2);
    assert_eq!(
        merged.metadata(),
        &meta(&[("msg", "base".into()), ("left", 1i64.into()), ("right", 2i64.into())])
    );
}

#[tokio::test]
async fn test_delete_propagates() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    manager.sync("a", "b").unwrap();

    let r0 = a.add(bytes(b"short lived"), Metadata::new()).await.unwrap();
    a.delete(r0.content(), &BTreeSet::from([r0.hash()])).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;

    let tree = b.revisions(r0.content()).await.unwrap();
    assert!(tree.latest().unwrap().is_deleted());
    assert!(!b.has_content(r0.content()).await.unwrap());
    assert_eq!(manager.status()[0].state, AgentState::Started);
}

#[tokio::test]
async fn test_unsync_and_drop() {
    let (catalog, manager) = setup(&["a", "b", "c"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    manager.sync("a", "b").unwrap();
    manager.sync("c", "a").unwrap();
    assert_eq!(manager.agents().len(), 2);

    assert!(manager.unsync("a", "b"));
    assert!(!manager.unsync("a", "b"));

    let r0 = a.add(bytes(b"stays home"), Metadata::new()).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;
    assert!(!b.has_content(r0.content()).await.unwrap());

    manager.drop("a");
    assert!(manager.agents().is_empty());
}

#[tokio::test]
async fn test_stop_by_repository_name() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    manager.sync("a", "b").unwrap();

    manager.stop("b");
    let r0 = a.add(bytes(b"queued"), Metadata::new()).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;
    assert!(!b.has_content(r0.content()).await.unwrap());
    assert_eq!(manager.status()[0].state, AgentState::Stopped);

    manager.start("b");
    manager.wait_idle().await;
    assert!(b.has_content(r0.content()).await.unwrap());
}

#[tokio::test]
async fn test_unknown_repository_is_rejected() {
    let (_catalog, manager) = setup(&["a"]);
    assert!(manager.sync("a", "ghost").is_err());
    assert!(manager.index("ghost", Arc::new(MemoryIndex::new())).is_err());
    assert!(manager.agents().is_empty());
}

#[tokio::test]
async fn test_index_follows_repository() {
    let (catalog, manager) = setup(&["a"]);
    let a = catalog.get("a").unwrap();
    let index = Arc::new(MemoryIndex::new());
    assert!(manager.index("a", index.clone()).unwrap());
    assert_eq!(manager.agents()[0].kind, AgentKind::Index);

    let r0 = a
        .add(bytes(b"the quick brown fox"), meta(&[("title", "Animals".into())]))
        .await
        .unwrap();
    let content = r0.content();
    manager.signal("a");
    manager.wait_idle().await;
    assert_eq!(index.find("fox animals").await.unwrap(), vec![content]);
    assert_eq!(index.indexed(content).await.unwrap(), Some(r0.hash()));

    let r1 = a
        .update(content, &BTreeSet::from([r0.hash()]), meta(&[("title", "Wildlife".into())]))
        .await
        .unwrap();
    manager.signal("a");
    manager.wait_idle().await;
    assert_eq!(index.find("wildlife").await.unwrap(), vec![content]);
    assert!(index.find("animals").await.unwrap().is_empty());
    assert_eq!(index.indexed(content).await.unwrap(), Some(r1.hash()));

    a.delete(content, &BTreeSet::from([r1.hash()])).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;
    assert!(index.find("fox").await.unwrap().is_empty());
    assert!(index.is_empty().await);
}

#[tokio::test]
async fn test_replica_index_is_reached_through_sync() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let index = Arc::new(MemoryIndex::new());
    manager.sync("a", "b").unwrap();
    manager.index("b", index.clone()).unwrap();

    let r0 = a.add(bytes(b"indexed downstream"), Metadata::new()).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;
    assert_eq!(index.find("downstream").await.unwrap(), vec![r0.content()]);
}

#[tokio::test]
async fn test_on_disk_repositories_replicate() {
    let tmp = TempDir::new().unwrap();
    let catalog = Arc::new(Catalog::new());
    for name in ["a", "b"] {
        let repo = Repository::open(name, &tmp.path().join(name)).unwrap();
        catalog.insert(Arc::new(repo));
    }
    let manager = AgentManager::new(catalog.clone(), AgentOptions { batch_size: 2 }, Handle::current());
    manager.sync("a", "b").unwrap();

    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    let data = vec![42u8; 200_000];
    let content = Hash::from_data(&data);
    a.add(Box::new(std::io::Cursor::new(data.clone())), meta(&[("big", true.into())]))
        .await
        .unwrap();
    a.add(bytes(b"small one"), Metadata::new()).await.unwrap();
    a.add(bytes(b"small two"), Metadata::new()).await.unwrap();
    manager.signal("a");
    manager.wait_idle().await;

    assert_eq!(read_all(&b, content).await, data);
    assert_eq!(b.info().await.unwrap().contents, 3);
}

#[tokio::test]
async fn test_redelivered_create_does_not_restore_deleted_bytes() {
    let (catalog, manager) = setup(&["a", "b"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    manager.sync("a", "b").unwrap();

    let r0 = a.add(bytes(b"secret"), Metadata::new()).await.unwrap();
    let content = r0.content();
    manager.signal("a");
    manager.wait_idle().await;
    b.delete(content, &BTreeSet::from([r0.hash()])).await.unwrap();
    assert!(!b.has_content(content).await.unwrap());

    // a fresh link starts from the beginning of a's log
    manager.unsync("a", "b");
    manager.sync("a", "b").unwrap();
    manager.wait_idle().await;

    assert!(b.revisions(content).await.unwrap().latest().unwrap().is_deleted());
    assert!(!b.has_content(content).await.unwrap());
}

#[tokio::test]
async fn test_ring_with_concurrent_delete_drops_bytes_everywhere() {
    let (catalog, manager) = setup(&["a", "b", "c"]);
    let a = catalog.get("a").unwrap();
    let b = catalog.get("b").unwrap();
    let c = catalog.get("c").unwrap();
    manager.sync("a", "b").unwrap();
    manager.sync("b", "c").unwrap();
    manager.sync("c", "a").unwrap();

    let r0 = a.add(bytes(b"contested"), meta(&[("v", 0i64.into())])).await.unwrap();
    let content = r0.content();
    manager.signal("a");
    manager.wait_idle().await;

    let base = BTreeSet::from([r0.hash()]);
    a.update(content, &base, meta(&[("v", 1i64.into())])).await.unwrap();
    b.update(content, &base, meta(&[("v", 2i64.into())])).await.unwrap();
    c.delete(content, &base).await.unwrap();
    for name in ["a", "b", "c"] {
        manager.signal(name);
    }
    manager.wait_idle().await;

    let expected = heads(&a, content).await;
    for repo in [&a, &b, &c] {
        assert_eq!(heads(repo, content).await, expected);
        assert!(repo.revisions(content).await.unwrap().latest().unwrap().is_deleted());
        assert!(!repo.has_content(content).await.unwrap());
    }
    assert!(manager.status().iter().all(|s| s.state == AgentState::Started));
}
