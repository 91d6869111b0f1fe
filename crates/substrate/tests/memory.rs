#![forbid(unsafe_code)]

use futures::StreamExt;
use horizon_substrate::{FaultOp, MemoryKv, Operation, Substrate, SubstrateError};

async fn next_rev(s: &mut horizon_substrate::Subscription) -> (String, u64, Operation) {
    let e = tokio::time::timeout(std::time::Duration::from_secs(2), s.next())
        .await
        .expect("timed out waiting for entry")
        .expect("stream ended")
        .expect("stream error");
    (e.key, e.revision, e.operation)
}

#[tokio::test]
async fn create_is_exclusive_and_revisions_increase() {
    let kv = MemoryKv::new();
    let r1 = kv.create("A.ns.x", b"1".to_vec()).await.unwrap();
    assert_eq!(r1, 1);
    assert_eq!(kv.create("A.ns.x", b"2".to_vec()).await, Err(SubstrateError::KeyExists));
    let r2 = kv.update("A.ns.x", b"3".to_vec(), Some(r1)).await.unwrap();
    assert!(r2 > r1);
    assert_eq!(
        kv.update("A.ns.x", b"4".to_vec(), Some(r1)).await,
        Err(SubstrateError::WrongLastRevision { expected: r1, current: r2 })
    );
    assert_eq!(kv.get("A.ns.x").await.unwrap().value.as_deref(), Some(&b"3"[..]));
}

#[tokio::test]
async fn update_and_delete_need_a_record() {
    let kv = MemoryKv::new();
    assert_eq!(kv.update("A.ns.x", b"1".to_vec(), None).await, Err(SubstrateError::KeyNotFound));
    assert_eq!(kv.delete("A.ns.x", None).await, Err(SubstrateError::KeyNotFound));
    let r = kv.create("A.ns.x", b"1".to_vec()).await.unwrap();
    assert!(matches!(kv.delete("A.ns.x", Some(r + 10)).await, Err(SubstrateError::WrongLastRevision { .. })));
    kv.delete("A.ns.x", Some(r)).await.unwrap();
    assert_eq!(kv.get("A.ns.x").await, Err(SubstrateError::KeyNotFound));
    // Re-created keys never reuse an old revision.
    let again = kv.create("A.ns.x", b"1".to_vec()).await.unwrap();
    assert!(again > r + 1);
}

#[tokio::test]
async fn writes_validate_keys_reads_do_not() {
    let kv = MemoryKv::new();
    assert_eq!(kv.create("A.n*s.x", vec![]).await, Err(SubstrateError::InvalidKey("A.n*s.x".into())));
    assert_eq!(kv.get("A.n*s.x").await, Err(SubstrateError::KeyNotFound));
}

#[tokio::test]
async fn list_is_prefix_scoped_and_ordered() {
    let kv = MemoryKv::new();
    for k in ["B.ns.b", "A.ns.z", "A.ns.a", "A.other.m", "AB.ns.q"] {
        kv.create(k, vec![]).await.unwrap();
    }
    let keys: Vec<String> = kv.list("A.").await.unwrap().into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["A.ns.a", "A.ns.z", "A.other.m"]);
    assert_eq!(kv.list("").await.unwrap().len(), 5);
}

#[tokio::test]
async fn watch_snapshot_then_live() {
    let kv = MemoryKv::new();
    kv.create("A.ns.a", b"1".to_vec()).await.unwrap();
    kv.create("B.ns.b", b"1".to_vec()).await.unwrap();
    let mut s = kv.watch("A.", None).await.unwrap();
    assert_eq!((s.head, s.backlog), (2, 1));
    assert_eq!(next_rev(&mut s).await, ("A.ns.a".into(), 1, Operation::Put));
    kv.update("B.ns.b", b"2".to_vec(), None).await.unwrap();
    kv.update("A.ns.a", b"2".to_vec(), None).await.unwrap();
    kv.delete("A.ns.a", None).await.unwrap();
    assert_eq!(next_rev(&mut s).await, ("A.ns.a".into(), 4, Operation::Put));
    assert_eq!(next_rev(&mut s).await, ("A.ns.a".into(), 5, Operation::Delete));
}

#[tokio::test]
async fn watch_resumes_from_revision() {
    let kv = MemoryKv::new();
    let r1 = kv.create("A.ns.a", b"1".to_vec()).await.unwrap();
    let r2 = kv.update("A.ns.a", b"2".to_vec(), Some(r1)).await.unwrap();
    let r3 = kv.update("A.ns.a", b"3".to_vec(), Some(r2)).await.unwrap();
    let mut s = kv.watch("A.", Some(r2)).await.unwrap();
    assert_eq!((s.head, s.backlog), (r3, 2));
    assert_eq!(next_rev(&mut s).await.1, r2);
    assert_eq!(next_rev(&mut s).await.1, r3);
    let r4 = kv.update("A.ns.a", b"4".to_vec(), Some(r3)).await.unwrap();
    assert_eq!(next_rev(&mut s).await.1, r4);
}

#[tokio::test]
async fn lagging_subscriber_recovers_every_change() {
    let kv = MemoryKv::with_capacity(2);
    let mut s = kv.watch("A.", Some(1)).await.unwrap();
    for i in 0..20u32 {
        kv.create(&format!("A.ns.k{}", i), vec![]).await.unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(next_rev(&mut s).await.1);
    }
    assert_eq!(seen, (1..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn dropping_stream_releases_subscription() {
    let kv = MemoryKv::new();
    let s1 = kv.watch("", None).await.unwrap();
    let s2 = kv.watch("A.", Some(1)).await.unwrap();
    assert_eq!(kv.watchers(), 2);
    drop(s1);
    assert_eq!(kv.watchers(), 1);
    drop(s2);
    assert_eq!(kv.watchers(), 0);
}

#[tokio::test]
async fn injected_faults_fire_once() {
    let kv = MemoryKv::new();
    kv.fail_next(FaultOp::Get, 1);
    assert!(matches!(kv.get("A.ns.a").await, Err(SubstrateError::Backend(_))));
    assert_eq!(kv.get("A.ns.a").await, Err(SubstrateError::KeyNotFound));
}
