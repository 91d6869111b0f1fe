use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use horizon_core::{ObjectKey, Scope, Status};
use horizon_store::{Change, CreateRequest, Ctx, DeleteRequest, Store, UpdateRequest, WatchEvent, WatchRequest, Watcher};
use horizon_substrate::MemoryKv;
use serde_json::json;

fn setup() -> (MemoryKv, Store) {
    let kv = MemoryKv::new();
    let store = Store::new(Arc::new(kv.clone()));
    (kv, store)
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("Widget", "dev", name)
}

fn data(name: &str, n: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({"kind": "Widget", "metadata": {"name": name, "namespace": "dev"}, "spec": {"n": n}})).unwrap()
}

async fn next(w: &mut Watcher) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(2), w.next())
        .await
        .expect("watch event in time")
        .expect("stream open")
        .expect("event ok")
}

#[tokio::test]
async fn create_and_updates_arrive_in_order() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    let mut w = store.watch(&ctx, WatchRequest { scope: Scope::kind("Widget"), from: None }).await.unwrap();

    let v1 = store.create(&ctx, CreateRequest { key: key("w"), data: data("w", 1) }).await.unwrap();
    let v2 = store.update(&ctx, UpdateRequest { key: key("w"), data: data("w", 2), revision: v1.revision() }).await.unwrap();
    store.update(&ctx, UpdateRequest { key: key("w"), data: data("w", 3), revision: v2.revision() }).await.unwrap();

    let mut revs = Vec::new();
    for want in 1..=3 {
        let ev = next(&mut w).await;
        assert_eq!(ev.key, key("w"));
        let obj = ev.object().expect("put event");
        assert_eq!(obj.fields["spec"]["n"], want);
        assert_eq!(obj.revision(), Some(ev.revision));
        revs.push(ev.revision);
    }
    assert!(revs.windows(2).all(|p| p[0] < p[1]), "{:?}", revs);
    assert_eq!(w.last_revision(), revs.last().copied());
}

#[tokio::test]
async fn snapshot_first_then_live() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    for name in ["b", "a"] {
        store.create(&ctx, CreateRequest { key: key(name), data: data(name, 0) }).await.unwrap();
    }
    let other = CreateRequest { key: ObjectKey::new("Gadget", "dev", "g"), data: b"{}".to_vec() };
    store.create(&ctx, other).await.unwrap();

    let mut w = store.watch(&ctx, WatchRequest { scope: Scope::kind("Widget").namespace("dev"), from: None }).await.unwrap();
    assert_eq!(next(&mut w).await.key, key("a"));
    assert_eq!(next(&mut w).await.key, key("b"));

    store.delete(&ctx, DeleteRequest { key: key("a"), revision: None }).await.unwrap();
    let ev = next(&mut w).await;
    assert_eq!(ev.key, key("a"));
    assert_eq!(ev.change, Change::Delete);
    assert_eq!(ev.revision, 4);
}

#[tokio::test]
async fn resume_token_continues_where_the_last_watcher_stopped() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    let mut w = store.watch(&ctx, WatchRequest { scope: Scope::all(), from: Some(1) }).await.unwrap();
    store.create(&ctx, CreateRequest { key: key("a"), data: data("a", 0) }).await.unwrap();
    store.create(&ctx, CreateRequest { key: key("b"), data: data("b", 0) }).await.unwrap();
    next(&mut w).await;
    next(&mut w).await;
    let token = w.resume_from();
    assert_eq!(token, Some(3));
    drop(w);

    store.update(&ctx, UpdateRequest { key: key("a"), data: data("a", 1), revision: None }).await.unwrap();
    store.delete(&ctx, DeleteRequest { key: key("b"), revision: None }).await.unwrap();

    let mut w = store.watch(&ctx, WatchRequest { scope: Scope::all(), from: token }).await.unwrap();
    let ev = next(&mut w).await;
    assert_eq!((ev.key.name.as_str(), ev.revision), ("a", 3));
    let ev = next(&mut w).await;
    assert_eq!((ev.key.name.as_str(), ev.revision), ("b", 4));
    assert!(ev.is_delete());
}

#[tokio::test]
async fn cancelling_the_context_ends_the_stream() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    let mut w = store.watch(&ctx, WatchRequest::default()).await.unwrap();
    ctx.cancel();
    let err = tokio::time::timeout(Duration::from_secs(2), w.next()).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.status(), Status::Cancelled);
    assert!(w.next().await.is_none());
}

#[tokio::test]
async fn dropping_the_watcher_releases_the_subscription() {
    let (kv, store) = setup();
    let ctx = Ctx::background();
    assert_eq!(kv.watchers(), 0);
    let a = store.watch(&ctx, WatchRequest::default()).await.unwrap();
    let b = store.watch(&ctx, WatchRequest { scope: Scope::kind("Widget"), from: None }).await.unwrap();
    assert_eq!(kv.watchers(), 2);
    drop(a);
    assert_eq!(kv.watchers(), 1);
    drop(b);
    assert_eq!(kv.watchers(), 0);
}

#[tokio::test]
async fn invalid_scope_is_rejected() {
    let (_kv, store) = setup();
    let err = store
        .watch(&Ctx::background(), WatchRequest { scope: Scope::kind("Wid.get"), from: None })
        .await
        .err()
        .unwrap();
    assert_eq!(err.status(), Status::BadRequest);
}

#[tokio::test]
async fn snapshot_cut_short_resumes_with_a_new_snapshot() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    // Key order and revision order disagree: b is older than a.
    for name in ["b", "a"] {
        store.create(&ctx, CreateRequest { key: key(name), data: data(name, 0) }).await.unwrap();
    }
    let scope = Scope::kind("Widget");

    let mut w = store.watch(&ctx, WatchRequest { scope: scope.clone(), from: None }).await.unwrap();
    let ev = next(&mut w).await;
    assert_eq!((ev.key.name.as_str(), ev.revision), ("a", 2));
    assert!(w.in_snapshot());
    assert_eq!(w.resume_from(), None);
    drop(w);

    let mut w = store.watch(&ctx, WatchRequest { scope: scope.clone(), from: None }).await.unwrap();
    assert_eq!(next(&mut w).await.key, key("a"));
    assert_eq!(next(&mut w).await.key, key("b"));
    assert!(!w.in_snapshot());
    let token = w.resume_from();
    assert_eq!(token, Some(3));
    drop(w);

    store.create(&ctx, CreateRequest { key: key("c"), data: data("c", 0) }).await.unwrap();
    let mut w = store.watch(&ctx, WatchRequest { scope, from: token }).await.unwrap();
    let ev = next(&mut w).await;
    assert_eq!((ev.key.name.as_str(), ev.revision), ("c", 3));
}

#[tokio::test]
async fn empty_snapshot_resumes_past_the_head() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    let other = CreateRequest { key: ObjectKey::new("Gadget", "dev", "g"), data: b"{}".to_vec() };
    store.create(&ctx, other).await.unwrap();

    let w = store.watch(&ctx, WatchRequest { scope: Scope::kind("Widget"), from: None }).await.unwrap();
    assert!(!w.in_snapshot());
    assert_eq!(w.resume_from(), Some(2));
}

#[tokio::test]
async fn replay_token_follows_delivered_revisions() {
    let (_kv, store) = setup();
    let ctx = Ctx::background();
    for name in ["a", "b", "c"] {
        store.create(&ctx, CreateRequest { key: key(name), data: data(name, 0) }).await.unwrap();
    }
    let mut w = store.watch(&ctx, WatchRequest { scope: Scope::all(), from: Some(2) }).await.unwrap();
    assert_eq!(w.resume_from(), Some(2));
    assert_eq!(next(&mut w).await.revision, 2);
    assert_eq!(w.resume_from(), Some(3));
    assert_eq!(next(&mut w).await.revision, 3);
    assert_eq!(w.resume_from(), Some(4));
}
