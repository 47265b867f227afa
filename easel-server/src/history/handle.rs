//! Shared, async access to a session history
//!
//! A session's history is the serialization point for that session: writers
//! take the lock exclusively, readers share it and always see whole
//! messages. The work itself runs on the blocking pool so that a slow disk
//! under one session never stalls the runtime threads other sessions use.

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use super::{HistoryError, HistoryMessage, SessionHistory};

#[derive(Debug, Clone)]
pub struct HistoryHandle {
    id: Arc<str>,
    inner: Arc<RwLock<SessionHistory>>,
    /// Last index after the latest successful add or reset
    updates: Arc<watch::Sender<i64>>,
}

impl HistoryHandle {
    pub fn new(history: SessionHistory) -> Self {
        let id = Arc::from(history.id());
        let (updates, _) = watch::channel(history.last_index());
        Self {
            id,
            inner: Arc::new(RwLock::new(history)),
            updates: Arc::new(updates),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Watch for new messages; the value is the current last index
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.updates.subscribe()
    }

    /// Run `f` with shared access
    pub async fn read<R, F>(&self, f: F) -> Result<R, HistoryError>
    where
        F: FnOnce(&SessionHistory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.inner.clone().read_owned().await;
        tokio::task::spawn_blocking(move || f(&*guard))
            .await
            .map_err(|e| HistoryError::Task(e.to_string()))
    }

    /// Run `f` with exclusive access
    ///
    /// Subscribers are told when `f` added messages or reset the history.
    pub async fn write<R, F>(&self, f: F) -> Result<R, HistoryError>
    where
        F: FnOnce(&mut SessionHistory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = self.inner.clone().write_owned().await;
        let updates = Arc::clone(&self.updates);
        tokio::task::spawn_blocking(move || {
            let before = (guard.first_index(), guard.last_index());
            let result = f(&mut *guard);
            if (guard.first_index(), guard.last_index()) != before {
                updates.send_replace(guard.last_index());
            }
            result
        })
        .await
        .map_err(|e| HistoryError::Task(e.to_string()))
    }

    pub async fn add_message(&self, message: HistoryMessage) -> Result<bool, HistoryError> {
        self.write(move |h| h.add_message(message)).await?
    }

    pub async fn add_emergency_message(&self, message: HistoryMessage) -> Result<bool, HistoryError> {
        self.write(move |h| h.add_emergency_message(message)).await?
    }

    pub async fn reset(&self, messages: Vec<HistoryMessage>) -> Result<bool, HistoryError> {
        self.write(move |h| h.reset(messages)).await?
    }

    /// Messages after index `after`, with the last index
    pub async fn get_batch(&self, after: i64) -> Result<(Vec<HistoryMessage>, i64), HistoryError> {
        self.read(move |h| h.get_batch(after)).await?
    }

    pub async fn cleanup_batches(&self, before: i64) -> Result<(), HistoryError> {
        self.write(move |h| h.cleanup_batches(before)).await
    }

    pub async fn close_block(&self) -> Result<(), HistoryError> {
        self.write(|h| h.close_block()).await?
    }

    pub async fn terminate(&self) -> Result<(), HistoryError> {
        self.write(|h| h.terminate()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryStorage, SessionMetadata};
    use easel_common::ProtocolVersion;

    fn handle() -> HistoryHandle {
        let meta = SessionMetadata::new("h", None, ProtocolVersion::current(), "alice");
        HistoryHandle::new(SessionHistory::create(&HistoryStorage::Memory, meta).unwrap())
    }

    #[tokio::test]
    async fn test_add_notifies_subscribers() {
        let history = handle();
        let mut rx = history.subscribe();
        assert_eq!(*rx.borrow_and_update(), -1);

        assert!(
            history
                .add_message(HistoryMessage::from(&b"hi"[..]))
                .await
                .unwrap()
        );
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 0);
    }

    #[tokio::test]
    async fn test_failed_add_does_not_notify() {
        let history = handle();
        history.write(|h| h.set_size_limit(1)).await.unwrap();
        let rx = history.subscribe();

        let added = history
            .add_message(HistoryMessage::from(&b"too big"[..]))
            .await
            .unwrap();
        assert!(!added);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_write_closure_appending_notifies() {
        let history = handle();
        let mut rx = history.subscribe();
        history
            .write(|h| h.add_emergency_message(HistoryMessage::from(&b"join"[..])))
            .await
            .unwrap()
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 0);

        // Metadata changes do not move the indices
        history.write(|h| h.set_title("quiet")).await.unwrap().unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_empty_reset_notifies() {
        let history = handle();
        history
            .add_message(HistoryMessage::from(&b"x"[..]))
            .await
            .unwrap();
        let mut rx = history.subscribe();
        rx.borrow_and_update();

        assert!(history.reset(Vec::new()).await.unwrap());
        assert!(rx.has_changed().unwrap());
        let first = history.read(|h| h.first_index()).await.unwrap();
        assert_eq!(first, 1);
    }

    #[tokio::test]
    async fn test_reset_then_batch() {
        let history = handle();
        for _ in 0..3 {
            history
                .add_message(HistoryMessage::from(&b"x"[..]))
                .await
                .unwrap();
        }
        history
            .reset(vec![HistoryMessage::from(&b"image"[..])])
            .await
            .unwrap();

        let (batch, last) = history.get_batch(-1).await.unwrap();
        assert_eq!(last, 3);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_bytes(), b"image");
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let history = handle();
        let mut tasks = Vec::new();
        for i in 0..20u8 {
            let h = history.clone();
            tasks.push(tokio::spawn(async move {
                h.add_message(HistoryMessage::from(vec![i])).await.unwrap()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        let (batch, last) = history.get_batch(-1).await.unwrap();
        assert_eq!(batch.len(), 20);
        assert_eq!(last, 19);
    }
}
