use serde_json::{json, Map};

use fleetcast::directory::NodeDirectory;
use fleetcast::error::QueueError;
use fleetcast::job::{EnvMode, Envelope, JobTemplate};
use fleetcast::queue::{JobQueue, MemoryQueue, QueueEntry, SpoolQueue};

fn entries(jid: &str, nodes: &[&str]) -> Vec<QueueEntry> {
    let template = JobTemplate::new(jid, "sys.ping", vec![json!(1)], Map::new());
    nodes
        .iter()
        .map(|node| QueueEntry {
            node: node.to_string(),
            jid: jid.to_string(),
            envelope: Envelope::seal(&template.for_node(node).record, EnvMode::Clear, None)
                .unwrap(),
        })
        .collect()
}

fn files_under(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// =============================================================================
// SpoolQueue
// =============================================================================

#[tokio::test]
async fn test_spool_put_get_delete() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());

    spool.put_many(entries("j1", &["web-1", "web-2"])).await.unwrap();

    assert!(dir.path().join("web-1/j1.json").is_file());
    let envelope = spool.get("web-2", "j1").await.unwrap().unwrap();
    let record = envelope.open(None).unwrap();
    assert_eq!(record.jid, "j1");
    assert_eq!(record.args, vec![json!(1)]);

    assert!(spool.get("web-3", "j1").await.unwrap().is_none());
    assert!(spool.delete("web-1", "j1").await.unwrap());
    assert!(!spool.delete("web-1", "j1").await.unwrap());
    assert!(spool.get("web-1", "j1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_spool_file_is_the_envelope_json() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());
    spool.put_many(entries("j1", &["web-1"])).await.unwrap();

    let body = std::fs::read(dir.path().join("web-1/j1.json")).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["env"], "clear");
    assert_eq!(value["payload"]["status"], "READY");
}

#[tokio::test]
async fn test_spool_get_many_covers_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());
    spool.put_many(entries("j1", &["web-1"])).await.unwrap();

    let found = spool
        .get_many(&[
            ("web-1".to_string(), "j1".to_string()),
            ("web-2".to_string(), "j1".to_string()),
        ])
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert!(found["web-1"].is_some());
    assert!(found["web-2"].is_none());
}

#[tokio::test]
async fn test_spool_get_many_skips_unreadable_entry() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());
    spool.put_many(entries("j1", &["web-1"])).await.unwrap();
    spool.register_node("web-2").await.unwrap();
    std::fs::write(dir.path().join("web-2/j1.json"), br#"{"env":"cle"#).unwrap();

    let found = spool
        .get_many(&[
            ("web-1".to_string(), "j1".to_string()),
            ("web-2".to_string(), "j1".to_string()),
            ("../x".to_string(), "j1".to_string()),
        ])
        .await
        .unwrap();

    assert_eq!(found.len(), 3);
    assert!(found["web-1"].is_some());
    assert!(found["web-2"].is_none());
    assert!(found["../x"].is_none());
}

#[tokio::test]
async fn test_spool_rejects_escaping_components_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());

    let mut batch = entries("j1", &["web-1", "web-2"]);
    batch.push(entries("j1", &["../outside"]).remove(0));
    let err = spool.put_many(batch).await.unwrap_err();

    assert!(matches!(err, QueueError::Rejected(_)));
    assert!(files_under(&dir.path().join("web-1")).is_empty());
    assert!(!dir.path().join("web-2/j1.json").exists());
    assert!(!dir.path().parent().unwrap().join("outside").exists());

    assert!(spool.get("..", "j1").await.is_err());
    assert!(spool.delete("web-1", "../j1").await.is_err());
}

#[tokio::test]
async fn test_spool_malformed_entry_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());
    spool.register_node("web-1").await.unwrap();
    std::fs::write(dir.path().join("web-1/j1.json"), b"{not json").unwrap();

    let err = spool.get("web-1", "j1").await.unwrap_err();
    assert!(matches!(err, QueueError::Malformed { ref node, .. } if node == "web-1"));
}

#[tokio::test]
async fn test_spool_lists_registered_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path());
    for node in ["web-2", "web-1", "db-1"] {
        spool.register_node(node).await.unwrap();
    }
    std::fs::create_dir_all(dir.path().join(".staging")).unwrap();
    std::fs::write(dir.path().join("README"), b"spool").unwrap();

    assert_eq!(
        spool.resolve("web", None).await.unwrap(),
        vec!["web-1", "web-2"]
    );
    assert_eq!(
        spool.resolve(".*", Some("web-2")).await.unwrap(),
        vec!["db-1", "web-1"]
    );
    assert!(spool.register_node("../x").await.is_err());
}

#[tokio::test]
async fn test_spool_missing_root_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SpoolQueue::new(dir.path().join("nope"));
    assert!(spool.resolve(".*", None).await.is_err());
}

// =============================================================================
// MemoryQueue
// =============================================================================

#[tokio::test]
async fn test_memory_queue_capacity_is_all_or_nothing() {
    let queue = MemoryQueue::with_capacity(2);

    queue.put_many(entries("j1", &["a"])).await.unwrap();
    let err = queue.put_many(entries("j2", &["a", "b"])).await.unwrap_err();

    assert!(matches!(err, QueueError::Rejected(_)));
    assert_eq!(queue.len().await, 1);
    assert!(queue.get("a", "j2").await.unwrap().is_none());

    // Rewriting an existing key does not take extra room.
    queue.put_many(entries("j1", &["a", "b"])).await.unwrap();
    assert_eq!(queue.len().await, 2);
}

#[tokio::test]
async fn test_memory_queue_update_and_delete() {
    let queue = MemoryQueue::new();
    queue.put_many(entries("j1", &["a"])).await.unwrap();

    let updated = queue
        .update_with("a", "j1", |envelope| {
            if let Envelope::Clear(record) = envelope {
                record.ret = Some(json!("done"));
            }
        })
        .await;
    assert!(updated);
    assert!(!queue.update_with("b", "j1", |_| {}).await);

    let record = queue.get("a", "j1").await.unwrap().unwrap().open(None).unwrap();
    assert_eq!(record.return_value(), Some(&json!("done")));

    assert!(queue.delete("a", "j1").await.unwrap());
    assert!(queue.is_empty().await);
}
