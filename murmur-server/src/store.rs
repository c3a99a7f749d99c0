//! Message Store: durable chat messages on an embedded SQLite database.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::blobs::{decode_inline, BlobKind, BlobStore, StoredBlob};
use crate::error::{ChatError, Result};
use crate::key::{ConversationKey, ConversationRef};
use crate::models::{Attachment, Message, NewMessage};

const SELECT_COLUMNS: &str = "id, sender_id, receiver_id, group_id, text, image, file,
                              image_handle, file_handle, created_at, updated_at";

/// Outcome of a successful delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub message_id: String,
    pub key: ConversationKey,
    /// Storage handles that were handed to the blob store for purging
    pub blob_handles: Vec<String>,
}

pub struct MessageStore {
    conn: Mutex<Connection>,
    blobs: Arc<dyn BlobStore>,
}

impl MessageStore {
    /// Open a file-backed store, or an in-memory one for `:memory:`
    pub fn open(path: &str, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        init_schema(&conn)?;
        info!(path = %path, "Message store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            blobs,
        })
    }

    pub fn in_memory(blobs: Arc<dyn BlobStore>) -> Result<Self> {
        Self::open(":memory:", blobs)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves no partial write behind, the connection is still usable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, upload attachments, then persist with server-assigned id and timestamps
    pub fn create(&self, sender_id: &str, input: NewMessage) -> Result<Message> {
        input.check(sender_id)?;

        let image = self.upload(BlobKind::Image, input.image.as_ref())?;
        let file = match self.upload(BlobKind::File, input.file.as_ref()) {
            Ok(file) => file,
            Err(e) => {
                self.purge_all(image.iter().map(|b| b.handle.clone()).collect());
                return Err(e);
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: input.receiver_id,
            group_id: input.group_id,
            text: input.text.filter(|t| !t.trim().is_empty()),
            image: image.as_ref().map(|b| b.url.clone()),
            file: file.as_ref().map(|b| b.url.clone()),
            image_handle: image.map(|b| b.handle),
            file_handle: file.map(|b| b.handle),
            created_at: now,
            updated_at: now,
        };

        let inserted = self.lock().execute(
            "INSERT INTO messages (id, sender_id, receiver_id, group_id, text, image, file,
                                   image_handle, file_handle, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.sender_id,
                message.receiver_id,
                message.group_id,
                message.text,
                message.image,
                message.file,
                message.image_handle,
                message.file_handle,
                message.created_at,
                message.updated_at,
            ],
        );
        if let Err(e) = inserted {
            self.purge_all(message.blob_handles());
            return Err(e.into());
        }

        debug!(id = %message.id, key = %message.conversation_key(), "Message created");
        Ok(message)
    }

    pub fn get(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.lock();
        let message = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", SELECT_COLUMNS),
                [message_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// All messages of a conversation, oldest first
    pub fn list_for_conversation(
        &self,
        viewer: &str,
        conversation: &ConversationRef,
    ) -> Result<Vec<Message>> {
        let conn = self.lock();
        let messages = match conversation {
            ConversationRef::Direct { user_id } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE group_id IS NULL
                       AND ((sender_id = ?1 AND receiver_id = ?2)
                         OR (sender_id = ?2 AND receiver_id = ?1))
                     ORDER BY created_at ASC, seq ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![viewer, user_id], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            ConversationRef::Group { group_id } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages
                     WHERE group_id = ?1
                     ORDER BY created_at ASC, seq ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map([group_id], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(messages)
    }

    /// Remove a message owned by `requester` and purge its stored blobs
    pub fn delete_by_id(&self, message_id: &str, requester: &str) -> Result<Deletion> {
        let message = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let message = tx
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", SELECT_COLUMNS),
                    [message_id],
                    row_to_message,
                )
                .optional()?
                .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;

            if message.sender_id != requester {
                return Err(ChatError::Forbidden {
                    message_id: message_id.to_string(),
                    requester: requester.to_string(),
                });
            }

            tx.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;
            tx.commit()?;
            message
        };

        let blob_handles = message.blob_handles();
        self.purge_all(blob_handles.clone());

        debug!(id = %message_id, "Message deleted");
        Ok(Deletion {
            message_id: message.id.clone(),
            key: message.conversation_key(),
            blob_handles,
        })
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn upload(&self, kind: BlobKind, attachment: Option<&Attachment>) -> Result<Option<StoredBlob>> {
        match attachment {
            Some(attachment) => {
                let bytes = decode_inline(&attachment.data)?;
                Ok(Some(self.blobs.upload(kind, &bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Purge failures never fail the surrounding operation
    fn purge_all(&self, handles: Vec<String>) {
        for handle in handles {
            if let Err(e) = self.blobs.purge(&handle) {
                warn!(handle = %handle, error = %e, "Failed to purge blob");
            }
        }
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            sender_id TEXT NOT NULL,
            receiver_id TEXT,
            group_id TEXT,
            text TEXT,
            image TEXT,
            file TEXT,
            image_handle TEXT,
            file_handle TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK ((receiver_id IS NULL) <> (group_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_direct ON messages(sender_id, receiver_id);
        CREATE INDEX IF NOT EXISTS idx_messages_group_id ON messages(group_id);
        CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
        ",
    )?;
    Ok(())
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        group_id: row.get(3)?,
        text: row.get(4)?,
        image: row.get(5)?,
        file: row.get(6)?,
        image_handle: row.get(7)?,
        file_handle: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::LocalBlobStore;

    /// Blob store whose purge always fails
    struct BrokenPurge;

    impl BlobStore for BrokenPurge {
        fn upload(&self, _kind: BlobKind, _bytes: &[u8]) -> Result<StoredBlob> {
            Ok(StoredBlob {
                url: "/blobs/x".to_string(),
                handle: "x".to_string(),
            })
        }

        fn purge(&self, _handle: &str) -> Result<()> {
            Err(std::io::Error::other("storage offline").into())
        }
    }

    fn test_store() -> (MessageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path(), "/blobs").unwrap());
        (MessageStore::in_memory(blobs).unwrap(), dir)
    }

    #[test]
    fn test_create_assigns_id_and_timestamps() {
        let (store, _dir) = test_store();
        let msg = store
            .create("alice", NewMessage::text_to("bob", "hi"))
            .unwrap();

        assert!(!msg.id.is_empty());
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.receiver_id.as_deref(), Some("bob"));
        assert!(msg.group_id.is_none());
        assert_eq!(msg.created_at, msg.updated_at);
        assert_eq!(store.get(&msg.id).unwrap(), Some(msg));
    }

    #[test]
    fn test_create_without_target_fails() {
        let (store, _dir) = test_store();
        let input = NewMessage {
            text: Some("hi".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.create("alice", input),
            Err(ChatError::Validation(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_list_direct_conversation_is_scoped_and_ordered() {
        let (store, _dir) = test_store();
        store.create("alice", NewMessage::text_to("bob", "1")).unwrap();
        store.create("bob", NewMessage::text_to("alice", "2")).unwrap();
        store.create("alice", NewMessage::text_to("carol", "other")).unwrap();
        store.create("alice", NewMessage::text_to_group("g1", "group")).unwrap();
        store.create("alice", NewMessage::text_to("bob", "3")).unwrap();

        let from_alice = store
            .list_for_conversation("alice", &ConversationRef::direct("bob"))
            .unwrap();
        let texts: Vec<_> = from_alice.iter().filter_map(|m| m.text.as_deref()).collect();
        assert_eq!(texts, vec!["1", "2", "3"]);
        assert!(from_alice
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));

        // Same conversation seen from the other side
        let from_bob = store
            .list_for_conversation("bob", &ConversationRef::direct("alice"))
            .unwrap();
        assert_eq!(from_alice, from_bob);
    }

    #[test]
    fn test_list_group_and_empty_conversation() {
        let (store, _dir) = test_store();
        store.create("alice", NewMessage::text_to_group("g1", "a")).unwrap();
        store.create("bob", NewMessage::text_to_group("g1", "b")).unwrap();
        store.create("bob", NewMessage::text_to_group("g2", "c")).unwrap();

        let g1 = store
            .list_for_conversation("carol", &ConversationRef::group("g1"))
            .unwrap();
        assert_eq!(g1.len(), 2);

        let empty = store
            .list_for_conversation("alice", &ConversationRef::direct("nobody"))
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_delete_by_non_sender_is_forbidden() {
        let (store, _dir) = test_store();
        let msg = store.create("alice", NewMessage::text_to("bob", "hi")).unwrap();

        let err = store.delete_by_id(&msg.id, "bob").unwrap_err();
        assert!(err.is_forbidden());
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.get(&msg.id).unwrap().is_some());
    }

    #[test]
    fn test_second_delete_is_not_found() {
        let (store, _dir) = test_store();
        let msg = store.create("alice", NewMessage::text_to("bob", "hi")).unwrap();

        let deletion = store.delete_by_id(&msg.id, "alice").unwrap();
        assert_eq!(deletion.message_id, msg.id);
        assert_eq!(deletion.key, ConversationKey::direct("alice", "bob"));
        assert!(deletion.blob_handles.is_empty());

        assert!(store.delete_by_id(&msg.id, "alice").unwrap_err().is_not_found());
        assert!(store.delete_by_id("missing", "alice").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_purges_attachments() {
        let (store, dir) = test_store();
        let input = NewMessage {
            receiver_id: Some("bob".into()),
            image: Some(Attachment::new("data:image/png;base64,cGl4ZWxz")),
            file: Some(Attachment::new("JVBERi0=")),
            ..Default::default()
        };
        let msg = store.create("alice", input).unwrap();
        let image_handle = msg.image_handle.clone().unwrap();
        let file_handle = msg.file_handle.clone().unwrap();
        assert!(msg.image.as_deref().unwrap().ends_with(&image_handle));
        assert!(msg.text.is_none());
        assert!(dir.path().join(&image_handle).exists());

        let deletion = store.delete_by_id(&msg.id, "alice").unwrap();
        assert_eq!(deletion.blob_handles, vec![image_handle.clone(), file_handle.clone()]);
        assert!(!dir.path().join(&image_handle).exists());
        assert!(!dir.path().join(&file_handle).exists());
    }

    #[test]
    fn test_invalid_attachment_is_rejected_before_insert() {
        let (store, _dir) = test_store();
        let input = NewMessage {
            receiver_id: Some("bob".into()),
            image: Some(Attachment::new("%%%")),
            ..Default::default()
        };
        assert!(matches!(
            store.create("alice", input),
            Err(ChatError::Validation(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_purge_failure_does_not_fail_delete() {
        let store = MessageStore::in_memory(Arc::new(BrokenPurge)).unwrap();
        let input = NewMessage {
            receiver_id: Some("bob".into()),
            image: Some(Attachment::new("aGk=")),
            ..Default::default()
        };
        let msg = store.create("alice", input).unwrap();

        let deletion = store.delete_by_id(&msg.id, "alice").unwrap();
        assert_eq!(deletion.blob_handles, vec!["x".to_string()]);
        assert_eq!(store.count().unwrap(), 0);
    }
}
