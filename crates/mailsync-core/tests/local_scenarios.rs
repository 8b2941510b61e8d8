//! Synchronization runs against directory-backed stores

use mailsync_common::types::{IdentityScheme, MessageFlags};
use mailsync_common::{StoreConfig, SyncOptions};
use mailsync_core::{CheckpointStore, Store, Synchronizer};
use mailsync_storage::{LocalStore, MailStore, OpenMode};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::TempDir;

fn raw(id: &str) -> Vec<u8> {
    format!(
        "Message-ID: {}\r\nFrom: Someone <someone@example.org>\r\nSubject: about {}\r\n\r\nbody\r\n",
        id, id
    )
    .into_bytes()
}

fn local_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: Some(dir.path().to_path_buf()),
        ..Default::default()
    }
}

/// Store reached "over the network", with every mailbox under `mail.`
fn prefixed_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: Some(dir.path().to_path_buf()),
        server: Some("imap.example.org".to_string()),
        prefix: "mail.".to_string(),
        ..Default::default()
    }
}

/// Checkpoint kept on the same directory tree as side A
fn synchronizer(a: &StoreConfig, b: &StoreConfig) -> Synchronizer {
    let timeout = Duration::from_secs(5);
    let checkpoint = CheckpointStore::new(
        Store::from_config("a", a, timeout).unwrap(),
        "msinfo",
        IdentityScheme::Header,
    );
    Synchronizer::new(
        "mail",
        Store::from_config("a", a, timeout).unwrap(),
        Store::from_config("b", b, timeout).unwrap(),
        checkpoint,
        IdentityScheme::Header,
        SyncOptions::default(),
        None,
    )
}

async fn backend(name: &str, config: &StoreConfig) -> LocalStore {
    let store = LocalStore::new(name, config).unwrap();
    store.connect().await.unwrap();
    store
}

async fn message_ids(store: &LocalStore, mailbox: &str) -> Vec<String> {
    let handle = store.open_mailbox(mailbox, OpenMode::ReadOnly).await.unwrap();
    let mut ids = Vec::new();
    for position in handle.positions() {
        let metadata = store.fetch_metadata(&handle, position).await.unwrap();
        ids.extend(metadata.message_id);
    }
    store.close(handle).await.unwrap();
    ids.sort();
    ids
}

async fn delete_message(store: &LocalStore, mailbox: &str, message_id: &str) {
    let mut handle = store.open_mailbox(mailbox, OpenMode::ReadWrite).await.unwrap();
    for position in handle.positions() {
        let metadata = store.fetch_metadata(&handle, position).await.unwrap();
        if metadata.message_id.as_deref() == Some(message_id) {
            store.flag_deleted(&handle, position).await.unwrap();
        }
    }
    assert_eq!(store.expunge(&mut handle).await.unwrap(), 1);
    store.close(handle).await.unwrap();
}

#[tokio::test]
async fn test_local_stores_converge_and_propagate_removal() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let (config_a, config_b) = (local_config(&dir_a), prefixed_config(&dir_b));

    let a = backend("a", &config_a).await;
    let b = backend("b", &config_b).await;
    a.create_mailbox("INBOX").await.unwrap();
    for id in ["<1@x>", "<2@x>"] {
        a.append_message("INBOX", MessageFlags::default(), None, &raw(id))
            .await
            .unwrap();
    }
    b.create_mailbox("mail.INBOX").await.unwrap();
    b.append_message("mail.INBOX", MessageFlags::default(), None, &raw("<3@x>"))
        .await
        .unwrap();

    let first = synchronizer(&config_a, &config_b).sync().await.unwrap();
    let inbox = first.mailbox("INBOX").unwrap();
    assert_eq!((inbox.copied_a_to_b, inbox.copied_b_to_a), (2, 1));
    assert_eq!(message_ids(&a, "INBOX").await, vec!["<1@x>", "<2@x>", "<3@x>"]);
    assert_eq!(
        message_ids(&b, "mail.INBOX").await,
        vec!["<1@x>", "<2@x>", "<3@x>"]
    );
    // the checkpoint persisted on disk next to the synced mailboxes
    assert!(dir_a.path().join("msinfo").join("index.json").exists());
    assert!(first.mailbox("msinfo").is_none());

    let second = synchronizer(&config_a, &config_b).sync().await.unwrap();
    assert_eq!(second.copied() + second.removed(), 0);

    delete_message(&b, "mail.INBOX", "<3@x>").await;
    let third = synchronizer(&config_a, &config_b).sync().await.unwrap();
    let inbox = third.mailbox("INBOX").unwrap();
    assert_eq!(inbox.removed_a, 1);
    assert_eq!(inbox.copied_a_to_b, 0);
    assert_eq!(message_ids(&a, "INBOX").await, vec!["<1@x>", "<2@x>"]);

    let fourth = synchronizer(&config_a, &config_b).sync().await.unwrap();
    assert_eq!(fourth.copied() + fourth.removed(), 0);
    let records = a.open_mailbox("msinfo", OpenMode::ReadOnly).await.unwrap();
    assert_eq!(records.exists(), 1);
    a.close(records).await.unwrap();
}
