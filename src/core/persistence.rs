use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use directories::ProjectDirs;
use tracing::debug;

use crate::core::session::Session;
use crate::core::stream::{StreamAccumulator, TurnOutcome};

/// Durable per-session state: the ordered message list, nullable resume
/// token, and the in-progress marker.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Session>, String>;
    async fn save(&self, session: &Session) -> Result<(), String>;
    /// Must succeed independently of `save`: a stuck marker would make a
    /// later load report a generation that is no longer running.
    async fn clear_in_progress(&self, session_id: &str) -> Result<(), String>;
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, session_id: &str) -> Result<Option<Session>, String> {
        Ok(self
            .sessions
            .lock()
            .expect("sessions lock")
            .get(session_id)
            .cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), String> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn clear_in_progress(&self, session_id: &str) -> Result<(), String> {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("sessions lock")
            .get_mut(session_id)
        {
            session.in_progress = false;
        }
        Ok(())
    }
}

/// One JSON document per session under a root directory.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Platform data directory, e.g. `~/.local/share/palaver/sessions`.
    pub fn default_root() -> Result<PathBuf, String> {
        let dirs = ProjectDirs::from("org", "permacommons", "palaver")
            .ok_or_else(|| "Unable to determine data directory.".to_string())?;
        Ok(dirs.data_dir().join("sessions"))
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn load(&self, session_id: &str) -> Result<Option<Session>, String> {
        let path = self.path_for(session_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.to_string()),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| err.to_string())
    }

    async fn save(&self, session: &Session) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| err.to_string())?;
        let contents = serde_json::to_string_pretty(session).map_err(|err| err.to_string())?;
        tokio::fs::write(self.path_for(&session.id), contents)
            .await
            .map_err(|err| err.to_string())
    }

    async fn clear_in_progress(&self, session_id: &str) -> Result<(), String> {
        let Some(mut session) = self.load(session_id).await? else {
            return Ok(());
        };
        if session.in_progress {
            session.in_progress = false;
            self.save(&session).await?;
        }
        Ok(())
    }
}

/// Flushes the accumulated assistant message, session token, and stats
/// on every termination path of a turn.
#[derive(Clone)]
pub struct PersistenceWriter {
    store: Arc<dyn SessionStore>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Persists whatever was accumulated, even for cancelled or errored
    /// outcomes. The in-progress marker is cleared last, regardless of
    /// whether the message save succeeded.
    pub async fn flush(
        &self,
        session: &mut Session,
        accumulator: StreamAccumulator,
        outcome: TurnOutcome,
    ) -> Result<(), String> {
        let token_invalid = accumulator.resume_token_invalid();
        if token_invalid {
            session.clear_resume_token();
        }

        let (message, metadata) = accumulator.into_message();
        if !token_invalid {
            if let Some(token) = metadata.resume_token.clone() {
                session.resume_token = Some(token);
            }
        }
        if let Some(message) = message {
            session.messages.push(message);
        }
        session.in_progress = false;
        debug!(session_id = %session.id, outcome = ?outcome, "Flushing turn");

        let saved = self.store.save(session).await;
        let cleared = self.store.clear_in_progress(&session.id).await;
        saved.and(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::ProviderEvent;
    use crate::core::message::MessageMetadata;
    use crate::core::session::SessionMode;

    fn accumulated(events: Vec<ProviderEvent>) -> StreamAccumulator {
        let mut acc = StreamAccumulator::new();
        for event in events {
            acc.apply(event);
        }
        acc
    }

    #[tokio::test]
    async fn flush_persists_partial_parts_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone());
        let mut session = Session::new("s1", PathBuf::from("/tmp"), SessionMode::Agent);
        session.in_progress = true;

        let acc = accumulated(vec![
            ProviderEvent::TextDelta("partial".to_string()),
            ProviderEvent::ToolCall {
                call_id: "c1".to_string(),
                name: "lookup".to_string(),
                input: serde_json::json!({}),
            },
            ProviderEvent::ToolResult {
                call_id: "c1".to_string(),
                output: "found".to_string(),
            },
        ]);
        writer
            .flush(&mut session, acc, TurnOutcome::Cancelled)
            .await
            .expect("flush");

        let loaded = store.load("s1").await.expect("load").expect("session");
        assert!(!loaded.in_progress);
        assert_eq!(loaded.messages.len(), 1);
        let message = &loaded.messages[0];
        assert!(message.is_assistant());
        assert!(message.rendered_text().contains("partial"));
        assert!(message
            .parts
            .iter()
            .any(|part| part.call_id() == Some("c1")));
    }

    #[tokio::test]
    async fn flush_with_no_parts_still_clears_marker() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone());
        let mut session = Session::new("s1", PathBuf::from("/tmp"), SessionMode::Agent);
        session.in_progress = true;
        store.save(&session).await.expect("seed");

        writer
            .flush(&mut session, StreamAccumulator::new(), TurnOutcome::Errored)
            .await
            .expect("flush");

        let loaded = store.load("s1").await.expect("load").expect("session");
        assert!(!loaded.in_progress);
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn flush_updates_resume_token_from_metadata() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistenceWriter::new(store.clone());
        let mut session = Session::new("s1", PathBuf::from("/tmp"), SessionMode::Agent);

        let acc = accumulated(vec![
            ProviderEvent::TextDelta("hi".to_string()),
            ProviderEvent::Metadata(MessageMetadata {
                resume_token: Some("rt-9".to_string()),
                ..Default::default()
            }),
            ProviderEvent::Done,
        ]);
        writer
            .flush(&mut session, acc, TurnOutcome::Completed)
            .await
            .expect("flush");

        assert_eq!(session.resume_token.as_deref(), Some("rt-9"));
    }

    #[tokio::test]
    async fn marker_clears_even_when_save_fails() {
        struct RejectingStore {
            inner: MemoryStore,
        }

        #[async_trait]
        impl SessionStore for RejectingStore {
            async fn load(&self, session_id: &str) -> Result<Option<Session>, String> {
                self.inner.load(session_id).await
            }
            async fn save(&self, _session: &Session) -> Result<(), String> {
                Err("disk full".to_string())
            }
            async fn clear_in_progress(&self, session_id: &str) -> Result<(), String> {
                self.inner.clear_in_progress(session_id).await
            }
        }

        let inner = MemoryStore::new();
        let mut seeded = Session::new("s1", PathBuf::from("/tmp"), SessionMode::Agent);
        seeded.in_progress = true;
        inner.save(&seeded).await.expect("seed");

        let writer = PersistenceWriter::new(Arc::new(RejectingStore {
            inner: inner.clone(),
        }));
        let mut session = seeded.clone();
        let result = writer
            .flush(&mut session, StreamAccumulator::new(), TurnOutcome::Errored)
            .await;

        assert!(result.is_err());
        let loaded = inner.load("s1").await.expect("load").expect("session");
        assert!(!loaded.in_progress);
    }

    #[tokio::test]
    async fn file_store_round_trips_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("sessions"));

        assert!(store.load("missing").await.expect("load").is_none());

        let mut session = Session::new("s1", PathBuf::from("/tmp"), SessionMode::Plan);
        session.in_progress = true;
        store.save(&session).await.expect("save");

        store.clear_in_progress("s1").await.expect("clear");
        let loaded = store.load("s1").await.expect("load").expect("session");
        assert!(!loaded.in_progress);
        assert_eq!(loaded.mode, SessionMode::Plan);
    }
}
