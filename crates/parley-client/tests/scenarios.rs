//! End-to-end flows over an on-disk SQLite database.

use std::sync::Arc;
use std::time::Duration;

use parley_client::pipeline::{PLACEHOLDER_KEY_MISMATCH, PLACEHOLDER_MISSING_KEY};
use parley_client::{
    BatchHealth, Client, ClientConfig, ClientError, DiagnosticEvent, FailureKind, KeyHealth,
    MessageStatus, RecoveryAction,
};
use parley_shared::crypto::{self, SymmetricKey};
use parley_shared::{ConversationId, UserId};
use parley_store::{KeyVault, LocalStore, MessageRow, MessageStore};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Client {
    let store = LocalStore::open_at(&dir.path().join("parley.db")).unwrap();
    Client::with_store(Arc::new(store), &ClientConfig::default())
}

fn open_shared(dir: &TempDir) -> Client {
    let config = ClientConfig {
        database_path: Some(dir.path().join("parley.db")),
        feed_poll_ms: 20,
        ..ClientConfig::default()
    };
    Client::open(&config).unwrap()
}

fn cid() -> ConversationId {
    ConversationId::from("task-42:chat")
}

fn alice() -> UserId {
    UserId::from("alice")
}

fn bob() -> UserId {
    UserId::from("bob")
}

#[tokio::test]
async fn fresh_conversation_round_trips_across_restart() {
    let dir = TempDir::new().unwrap();
    let participants = [alice(), bob()];

    let fingerprint = {
        let client = open(&dir);
        assert_eq!(client.keys.health(&cid()).await, KeyHealth::Missing);

        client
            .pipeline
            .send(&cid(), &alice(), &participants, "hello bob")
            .await
            .unwrap();
        client.keys.fingerprint_for(&cid()).await.unwrap()
    };

    let client = open(&dir);
    let presence = client.keys.presence(&cid()).await;
    assert!(!presence.in_memory);
    assert!(presence.in_durable);

    let batch = client.pipeline.fetch(&cid()).await.unwrap();
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].content, "hello bob");
    assert_eq!(batch.messages[0].sender_id, alice());
    assert!(batch.health.is_clean());
    assert_eq!(client.keys.fingerprint_for(&cid()).await.unwrap(), fingerprint);
}

#[tokio::test]
async fn generation_is_idempotent_across_restart() {
    let dir = TempDir::new().unwrap();

    let first = open(&dir).keys.ensure_key(&cid(), &[]).await.unwrap();
    let second = open(&dir).keys.ensure_key(&cid(), &[]).await.unwrap();

    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[tokio::test]
async fn forced_regeneration_strands_old_messages() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);
    let mut events = client.events.subscribe();

    client.pipeline.send(&cid(), &alice(), &[], "before 1").await.unwrap();
    client.pipeline.send(&cid(), &bob(), &[], "before 2").await.unwrap();

    let regen = client.keys.force_regenerate(&cid(), &[]).await.unwrap();
    assert!(regen.previous_fingerprint.is_some());
    assert!(matches!(
        events.recv().await.unwrap(),
        DiagnosticEvent::KeyRegenerated { .. }
    ));

    let batch = client.pipeline.fetch(&cid()).await.unwrap();
    assert_eq!(
        batch.health,
        BatchHealth::Total {
            failed: 2,
            cause: FailureKind::KeyMismatch
        }
    );
    assert_eq!(batch.recommended_action(), RecoveryAction::Regenerate);
    assert!(batch
        .messages
        .iter()
        .all(|m| m.content == PLACEHOLDER_KEY_MISMATCH));

    client.pipeline.send(&cid(), &alice(), &[], "after").await.unwrap();
    let batch = client.pipeline.fetch(&cid()).await.unwrap();
    assert_eq!(
        batch.health,
        BatchHealth::Partial {
            failed: 2,
            encrypted: 3
        }
    );
    assert_eq!(batch.messages[2].content, "after");

    assert_eq!(client.pipeline.purge_unreadable(&cid()).await.unwrap(), 2);
    assert!(client.pipeline.fetch(&cid()).await.unwrap().health.is_clean());
}

#[tokio::test]
async fn mixed_batch_yields_one_placeholder() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);
    let mut events = client.events.subscribe();

    for text in ["plain one", "plain two", "plain three"] {
        client
            .store
            .insert(&MessageRow::new(cid(), bob(), text.into()))
            .unwrap();
    }
    client.pipeline.send(&cid(), &alice(), &[], "sealed").await.unwrap();

    let stale = crypto::encrypt(&SymmetricKey::generate(), &cid(), "stale").unwrap();
    client
        .store
        .insert(&MessageRow::new(cid(), bob(), stale.to_payload()))
        .unwrap();

    let batch = client.pipeline.fetch(&cid()).await.unwrap();
    assert_eq!(batch.messages.len(), 5);

    let placeholders: Vec<_> = batch.failed().collect();
    assert_eq!(placeholders.len(), 1);
    assert_eq!(
        placeholders[0].status,
        MessageStatus::Failed(FailureKind::KeyMismatch)
    );
    assert_eq!(
        batch.health,
        BatchHealth::Partial {
            failed: 1,
            encrypted: 2
        }
    );

    let plain = batch
        .messages
        .iter()
        .filter(|m| m.status == MessageStatus::Plain)
        .count();
    assert_eq!(plain, 3);

    // Exactly one aggregate event for the batch.
    assert!(matches!(
        events.try_recv().unwrap(),
        DiagnosticEvent::BatchDegraded {
            action: RecoveryAction::PurgeUnreadable,
            ..
        }
    ));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn corrupt_key_record_heals_on_read() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);

    let old = client.keys.ensure_key(&cid(), &[]).await.unwrap();
    client.pipeline.send(&cid(), &alice(), &[], "unreachable").await.unwrap();
    client.store.save(&cid(), r#"{"key":"@@not-base64@@""#).unwrap();
    drop(client);

    let client = open(&dir);
    assert!(client.keys.presence(&cid()).await.corrupt);
    assert_eq!(client.keys.health(&cid()).await, KeyHealth::Corrupt);

    let batch = client.pipeline.fetch(&cid()).await.unwrap();
    assert_eq!(batch.messages[0].content, PLACEHOLDER_MISSING_KEY);
    assert_eq!(batch.recommended_action(), RecoveryAction::Refresh);
    assert!(client.store.load(&cid()).unwrap().is_none());

    let fresh = client.keys.ensure_key(&cid(), &[]).await.unwrap();
    assert_ne!(fresh.fingerprint(), old.fingerprint());
    assert_eq!(client.keys.health(&cid()).await, KeyHealth::Healthy);
}

#[tokio::test]
async fn missing_key_is_reported_not_generated() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);

    assert!(matches!(
        client.keys.store().get(&cid()).await,
        Err(ClientError::KeyNotFound(_))
    ));
    assert!(!client.keys.presence(&cid()).await.in_durable);
}

#[tokio::test]
async fn watch_sees_new_messages() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);
    let mut watch = client.pipeline.watch(&cid());

    client.pipeline.send(&cid(), &bob(), &[], "ping").await.unwrap();
    let batch = watch.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.messages.last().unwrap().content, "ping");

    client.pipeline.send(&cid(), &alice(), &[], "pong").await.unwrap();
    let batch = watch.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.messages.len(), 2);
}

#[tokio::test]
async fn delete_conversation_removes_rows_and_key() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);
    client.pipeline.send(&cid(), &alice(), &[], "gone").await.unwrap();

    assert_eq!(client.pipeline.delete_conversation(&cid()).await.unwrap(), 1);
    assert_eq!(client.keys.health(&cid()).await, KeyHealth::Missing);
    assert!(client.store.select(&cid(), 50).unwrap().is_empty());
}

#[tokio::test]
async fn watch_wakes_on_another_clients_send() {
    let dir = TempDir::new().unwrap();
    let writer = open_shared(&dir);
    let reader = open_shared(&dir);

    // Both sides agree on the key through the shared vault.
    writer.keys.ensure_key(&cid(), &[alice(), bob()]).await.unwrap();
    let mut watch = reader.pipeline.watch(&cid());

    writer
        .pipeline
        .send(&cid(), &alice(), &[], "across processes")
        .await
        .unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(5), watch.next_batch())
        .await
        .expect("watch never woke")
        .unwrap()
        .unwrap();
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].content, "across processes");
    assert_eq!(batch.messages[0].status, MessageStatus::Decrypted);
}

#[tokio::test]
async fn conversations_lists_keyed_conversations() {
    let dir = TempDir::new().unwrap();
    let client = open(&dir);
    let other = ConversationId::from("task-7:chat");

    client.pipeline.send(&cid(), &alice(), &[], "one").await.unwrap();
    client.pipeline.send(&cid(), &bob(), &[], "two").await.unwrap();
    client.keys.ensure_key(&other, &[]).await.unwrap();

    let summaries = client.conversations().await.unwrap();
    assert_eq!(summaries.len(), 2);

    let chat = summaries.iter().find(|s| s.conversation_id == cid()).unwrap();
    assert_eq!(chat.messages, 2);
    assert_eq!(chat.health, KeyHealth::Healthy);

    let quiet = summaries.iter().find(|s| s.conversation_id == other).unwrap();
    assert_eq!(quiet.messages, 0);

    client.pipeline.delete_conversation(&cid()).await.unwrap();
    assert_eq!(client.conversations().await.unwrap().len(), 1);
}
