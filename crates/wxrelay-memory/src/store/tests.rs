use super::{SessionStore, IN_MEMORY};
use std::time::Duration;
use wxrelay_core::{config::SessionConfig, message::ConversationId};

/// Create an in-memory store for testing.
async fn test_store() -> SessionStore {
    test_store_with(false).await
}

async fn test_store_with(group_shared_session: bool) -> SessionStore {
    let config = SessionConfig {
        db_path: IN_MEMORY.to_string(),
        default_persona: "default".to_string(),
        group_shared_session,
        ..Default::default()
    };
    SessionStore::new(&config).await.unwrap()
}

#[tokio::test]
async fn test_get_or_create_new_context() {
    let store = test_store().await;
    let alice = ConversationId::private("wxid_alice");
    let ctx = store.get_or_create(&alice).await.unwrap();
    assert_eq!(ctx.key, "wx849:wxid_alice");
    assert_eq!(ctx.persona, "default");
    assert_eq!(ctx.history_ref, None);
    assert!(!ctx.is_in_flight());
    assert_eq!(ctx.conversation, alice);

    // Second call returns the same row.
    store.set_persona(&ctx.key, "tutor").await.unwrap();
    let again = store.get_or_create(&alice).await.unwrap();
    assert_eq!(again.persona, "tutor");
}

#[tokio::test]
async fn test_group_key_policy() {
    let member = ConversationId::group("123@chatroom", "wxid_bob");

    let store = test_store().await;
    let ctx = store.get_or_create(&member).await.unwrap();
    assert_eq!(ctx.key, "wx849:123@chatroom:wxid_bob");
    assert!(ctx.conversation.is_group);

    let shared = test_store_with(true).await;
    let ctx = shared.get_or_create(&member).await.unwrap();
    assert_eq!(ctx.key, "wx849:123@chatroom");
}

#[tokio::test]
async fn test_in_flight_is_exclusive() {
    let store = test_store().await;
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_alice"))
        .await
        .unwrap();

    let first = store.try_set_in_flight(&ctx.key).await.unwrap();
    assert!(first.is_some());
    assert!(store.try_set_in_flight(&ctx.key).await.unwrap().is_none());

    let pending = first.unwrap();
    assert!(store.get(&ctx.key).await.unwrap().unwrap().is_in_flight());
    assert!(store.clear_in_flight(&pending).await.unwrap());
    assert!(store.try_set_in_flight(&ctx.key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_claims_single_winner() {
    let store = test_store().await;
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_alice"))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let key = ctx.key.clone();
            tokio::spawn(async move { store.try_set_in_flight(&key).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for h in handles {
        if h.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_stale_pending_cannot_clear_newer() {
    let store = test_store().await;
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_alice"))
        .await
        .unwrap();

    let old = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    assert!(store.clear_in_flight(&old).await.unwrap());
    let newer = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();

    // The earlier token no longer owns the flag.
    assert!(!store.clear_in_flight(&old).await.unwrap());
    assert!(!store.complete(&old, Some("conv-old")).await.unwrap());
    let current = store.get(&ctx.key).await.unwrap().unwrap();
    assert_eq!(current.in_flight, Some(newer.request_id));
    assert_eq!(current.history_ref, None);
}

#[tokio::test]
async fn test_complete_stores_history_and_releases() {
    let store = test_store().await;
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_alice"))
        .await
        .unwrap();

    let pending = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    assert!(store.complete(&pending, Some("conv-1")).await.unwrap());
    let after = store.get(&ctx.key).await.unwrap().unwrap();
    assert_eq!(after.history_ref.as_deref(), Some("conv-1"));
    assert!(!after.is_in_flight());

    // A reply without a history ref keeps the previous one.
    let pending = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    store.complete(&pending, None).await.unwrap();
    let after = store.get(&ctx.key).await.unwrap().unwrap();
    assert_eq!(after.history_ref.as_deref(), Some("conv-1"));
}

#[tokio::test]
async fn test_reset_starts_fresh() {
    let store = test_store().await;
    let alice = ConversationId::private("wxid_alice");
    let ctx = store.get_or_create(&alice).await.unwrap();
    store.set_persona(&ctx.key, "tutor").await.unwrap();
    store.set_history_ref(&ctx.key, Some("conv-1")).await.unwrap();

    assert!(store.reset(&ctx.key).await.unwrap());
    // Idempotent.
    assert!(!store.reset(&ctx.key).await.unwrap());

    let fresh = store.get_or_create(&alice).await.unwrap();
    assert_eq!(fresh.persona, "default");
    assert_eq!(fresh.history_ref, None);
}

#[tokio::test]
async fn test_reset_keeps_claim_of_running_exchange() {
    let store = test_store().await;
    let alice = ConversationId::private("wxid_alice");
    let ctx = store.get_or_create(&alice).await.unwrap();
    store.set_persona(&ctx.key, "tutor").await.unwrap();
    store.set_history_ref(&ctx.key, Some("conv-1")).await.unwrap();
    let pending = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();

    assert!(store.reset(&ctx.key).await.unwrap());

    // Still claimed: a new exchange cannot start alongside the running one.
    let during = store.get_or_create(&alice).await.unwrap();
    assert_eq!(during.in_flight, Some(pending.request_id));
    assert_eq!(during.persona, "default");
    assert_eq!(during.history_ref, None);
    assert!(store.try_set_in_flight(&ctx.key).await.unwrap().is_none());

    // The running exchange releases the claim but its history is dropped.
    assert!(store.complete(&pending, Some("conv-stale")).await.unwrap());
    let after = store.get(&ctx.key).await.unwrap().unwrap();
    assert!(!after.is_in_flight());
    assert_eq!(after.history_ref, None);

    // The next exchange records history normally.
    let next = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    assert!(store.complete(&next, Some("conv-2")).await.unwrap());
    let after = store.get(&ctx.key).await.unwrap().unwrap();
    assert_eq!(after.history_ref.as_deref(), Some("conv-2"));
}

#[tokio::test]
async fn test_abandoned_claim_is_taken_over() {
    let store = test_store().await.with_claim_timeout(Duration::ZERO);
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_alice"))
        .await
        .unwrap();

    let abandoned = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    let fresh = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    assert_ne!(abandoned.request_id, fresh.request_id);

    // The abandoned holder can no longer release or complete.
    assert!(!store.complete(&abandoned, Some("conv-old")).await.unwrap());
    assert!(store.complete(&fresh, Some("conv-new")).await.unwrap());
    let after = store.get(&ctx.key).await.unwrap().unwrap();
    assert_eq!(after.history_ref.as_deref(), Some("conv-new"));
}

#[tokio::test]
async fn test_evict_idle_drops_abandoned_claims() {
    let store = test_store().await.with_claim_timeout(Duration::ZERO);
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_stuck"))
        .await
        .unwrap();
    store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();

    assert_eq!(store.evict_idle(0).await.unwrap(), 1);
    assert!(store.get(&ctx.key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_set_history_ref_clears() {
    let store = test_store().await;
    let ctx = store
        .get_or_create(&ConversationId::private("wxid_alice"))
        .await
        .unwrap();
    store.set_history_ref(&ctx.key, Some("c")).await.unwrap();
    store.set_history_ref(&ctx.key, None).await.unwrap();
    assert_eq!(store.get(&ctx.key).await.unwrap().unwrap().history_ref, None);
    assert!(!store.set_history_ref("wx849:nobody", Some("c")).await.unwrap());

    // A running exchange does not overwrite a history cleared under it.
    let pending = store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    store.set_history_ref(&ctx.key, None).await.unwrap();
    assert!(store.complete(&pending, Some("late")).await.unwrap());
    assert_eq!(store.get(&ctx.key).await.unwrap().unwrap().history_ref, None);
}

#[tokio::test]
async fn test_evict_idle_skips_in_flight() {
    let store = test_store().await;
    let idle = store
        .get_or_create(&ConversationId::private("wxid_idle"))
        .await
        .unwrap();
    let busy = store
        .get_or_create(&ConversationId::private("wxid_busy"))
        .await
        .unwrap();
    store.try_set_in_flight(&busy.key).await.unwrap().unwrap();

    // A long TTL keeps everything.
    assert_eq!(store.evict_idle(3600).await.unwrap(), 0);

    // TTL 0: everything is idle, but the in-flight row stays.
    assert_eq!(store.evict_idle(0).await.unwrap(), 1);
    assert!(store.get(&idle.key).await.unwrap().is_none());
    assert!(store.get(&busy.key).await.unwrap().is_some());
}

#[tokio::test]
async fn test_release_stale_in_flight() {
    let store = test_store().await;
    for id in ["wxid_a", "wxid_b"] {
        let ctx = store
            .get_or_create(&ConversationId::private(id))
            .await
            .unwrap();
        store.try_set_in_flight(&ctx.key).await.unwrap().unwrap();
    }
    assert_eq!(store.stats().await.unwrap().in_flight, 2);
    assert_eq!(store.release_stale_in_flight().await.unwrap(), 2);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.conversations, 2);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_admin_registry() {
    let store = test_store().await;
    assert!(!store.is_admin("wxid_alice").await.unwrap());
    store.grant_admin("wxid_alice").await.unwrap();
    store.grant_admin("wxid_alice").await.unwrap();
    assert!(store.is_admin("wxid_alice").await.unwrap());
    assert!(!store.is_admin("wxid_bob").await.unwrap());
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let store = test_store().await;
    SessionStore::run_migrations(store.pool()).await.unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 4);
}

#[tokio::test]
async fn test_file_backed_store_persists() {
    let dir = std::env::temp_dir().join(format!("wxrelay-test-{}", uuid::Uuid::new_v4()));
    let config = SessionConfig {
        db_path: dir.join("sessions.db").to_string_lossy().into_owned(),
        ..Default::default()
    };
    {
        let store = SessionStore::new(&config).await.unwrap();
        let ctx = store
            .get_or_create(&ConversationId::private("wxid_alice"))
            .await
            .unwrap();
        store.set_persona(&ctx.key, "tutor").await.unwrap();
        store.pool().close().await;
    }
    let store = SessionStore::new(&config).await.unwrap();
    let ctx = store.get("wx849:wxid_alice").await.unwrap().unwrap();
    assert_eq!(ctx.persona, "tutor");
    store.pool().close().await;
    let _ = std::fs::remove_dir_all(&dir);
}
