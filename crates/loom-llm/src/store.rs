use crate::errors::{ProviderError, ProviderResult};
use crate::types::{Message, Metadata, Role, Thread, current_timestamp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug)]
struct ThreadLog {
    thread: Thread,
    messages: Vec<Message>,
}

/// Process-wide conversation store.
///
/// Appends are serialized per thread; distinct threads never contend on the
/// same lock after lookup.
#[derive(Clone, Debug, Default)]
pub struct ConversationStore {
    threads: Arc<Mutex<HashMap<String, Arc<Mutex<ThreadLog>>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> ProviderResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ProviderError::InvalidState("conversation store mutex poisoned".to_string()))
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_thread(&self, metadata: Option<Metadata>) -> ProviderResult<Thread> {
        let thread = Thread {
            id: format!("thread_{}", Uuid::new_v4().simple()),
            created_at: current_timestamp(),
            metadata: metadata.unwrap_or_default(),
        };
        lock(&self.threads)?.insert(
            thread.id.clone(),
            Arc::new(Mutex::new(ThreadLog {
                thread: thread.clone(),
                messages: Vec::new(),
            })),
        );
        Ok(thread)
    }

    fn log(&self, thread_id: &str) -> ProviderResult<Arc<Mutex<ThreadLog>>> {
        lock(&self.threads)?
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("thread", thread_id))
    }

    pub fn get_thread(&self, thread_id: &str) -> ProviderResult<Thread> {
        let log = self.log(thread_id)?;
        let guard = lock(&log)?;
        Ok(guard.thread.clone())
    }

    pub fn update_metadata(&self, thread_id: &str, metadata: Metadata) -> ProviderResult<Thread> {
        let log = self.log(thread_id)?;
        let mut guard = lock(&log)?;
        guard.thread.metadata.extend(metadata);
        Ok(guard.thread.clone())
    }

    pub fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: impl Into<String>,
        run_id: Option<String>,
    ) -> ProviderResult<Message> {
        let log = self.log(thread_id)?;
        let mut guard = lock(&log)?;
        let message = Message {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            thread_id: thread_id.to_string(),
            role,
            content: content.into(),
            created_at: current_timestamp(),
            run_id,
        };
        guard.messages.push(message.clone());
        Ok(message)
    }

    /// Messages in `[start, end)` of the thread's creation order.
    pub fn read_range(
        &self,
        thread_id: &str,
        start: usize,
        end: usize,
    ) -> ProviderResult<Vec<Message>> {
        let log = self.log(thread_id)?;
        let guard = lock(&log)?;
        let end = end.min(guard.messages.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(guard.messages[start..end].to_vec())
    }

    /// The most recent `limit` messages, oldest first.
    pub fn read_recent(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> ProviderResult<Vec<Message>> {
        let log = self.log(thread_id)?;
        let guard = lock(&log)?;
        let len = guard.messages.len();
        let start = limit.map_or(0, |limit| len.saturating_sub(limit));
        Ok(guard.messages[start..].to_vec())
    }

    pub fn message_count(&self, thread_id: &str) -> ProviderResult<usize> {
        let log = self.log(thread_id)?;
        let guard = lock(&log)?;
        Ok(guard.messages.len())
    }

    /// Removes a thread and its history. Returns whether it existed.
    pub fn clear(&self, thread_id: &str) -> ProviderResult<bool> {
        Ok(lock(&self.threads)?.remove(thread_id).is_some())
    }

    pub fn clear_all(&self) -> ProviderResult<()> {
        lock(&self.threads)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_creation_order_per_thread() {
        let store = ConversationStore::new();
        let thread = store.create_thread(None).expect("thread should be created");
        for content in ["one", "two", "three"] {
            store
                .append_message(&thread.id, Role::User, content, None)
                .expect("append should succeed");
        }

        let messages = store
            .read_range(&thread.id, 0, usize::MAX)
            .expect("range read should succeed");
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);

        let middle = store
            .read_range(&thread.id, 1, 2)
            .expect("range read should succeed");
        assert_eq!(middle.len(), 1);
        assert_eq!(middle[0].content, "two");

        let recent = store
            .read_recent(&thread.id, Some(2))
            .expect("recent read should succeed");
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn unknown_thread_is_not_found() {
        let store = ConversationStore::new();
        let error = store
            .append_message("missing", Role::User, "hi", None)
            .expect_err("unknown thread should fail");
        assert_eq!(error, ProviderError::not_found("thread", "missing"));
    }

    #[test]
    fn clear_removes_thread() {
        let store = ConversationStore::new();
        let thread = store.create_thread(None).expect("thread should be created");
        assert!(store.clear(&thread.id).expect("clear should succeed"));
        assert!(store.get_thread(&thread.id).is_err());
        assert!(!store.clear(&thread.id).expect("clear should succeed"));
    }

    #[test]
    fn metadata_updates_merge() {
        let store = ConversationStore::new();
        let thread = store
            .create_thread(Some(Metadata::from([("a".to_string(), "1".to_string())])))
            .expect("thread should be created");
        let updated = store
            .update_metadata(
                &thread.id,
                Metadata::from([("b".to_string(), "2".to_string())]),
            )
            .expect("update should succeed");
        assert_eq!(updated.metadata.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn concurrent_appends_to_one_thread_are_all_kept() {
        let store = ConversationStore::new();
        let thread = store.create_thread(None).expect("thread should be created");
        let mut handles = Vec::new();
        for index in 0..32 {
            let store = store.clone();
            let thread_id = thread.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message(&thread_id, Role::User, format!("m{index}"), None)
                    .expect("append should succeed");
            }));
        }
        for handle in handles {
            handle.await.expect("task should join");
        }
        assert_eq!(store.message_count(&thread.id).expect("count"), 32);
    }
}
