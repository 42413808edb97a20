//! Per-session conversation memory.
//!
//! A [`SessionStore`] maps session ids to [`Session`]s, creating them lazily
//! on first reference.  Each session guards its history with an async mutex;
//! the pipeline holds that lock for a whole turn so that two turns on the
//! same session can never interleave their messages.
//!
//! Memory is process-lifetime only.  Restarting the process loses every
//! session; transcripts can be exported explicitly with [`save_transcript`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{from_reader, to_writer_pretty};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::observability::{SESSIONS_CREATED, SESSIONS_EVICTED, SESSIONS_REJECTED};
use crate::types::{Message, Role};

/// One conversation thread and its ordered history.
#[derive(Debug)]
pub struct Session {
    id: String,
    history: tokio::sync::Mutex<Vec<Message>>,
}

impl Session {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a snapshot of the history.
    pub async fn history(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    /// Returns the number of messages in the history.
    pub async fn len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Returns true if nothing has been said in this session yet.
    pub async fn is_empty(&self) -> bool {
        self.history.lock().await.is_empty()
    }

    /// Appends a message to the end of the history.
    pub async fn append(&self, message: Message) {
        self.history.lock().await.push(message);
    }

    /// Clears the history.
    pub async fn clear(&self) {
        self.history.lock().await.clear();
    }

    /// Replaces the history wholesale, e.g. after loading a transcript.
    pub async fn replace_history(&self, messages: Vec<Message>) {
        *self.history.lock().await = messages;
    }

    /// Takes exclusive hold of the history for the duration of a turn.
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Vec<Message>> {
        self.history.lock().await
    }
}

/// What to do when a new session would exceed `max_sessions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhenFull {
    /// Drop the least recently used idle session to make room.
    #[default]
    EvictIdlest,
    /// Refuse to create the session.
    Reject,
}

/// Bounds on how many sessions are kept and for how long.
///
/// The default is unbounded with no expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionLimits {
    /// Maximum number of live sessions.
    pub max_sessions: Option<usize>,
    /// Sessions unused for longer than this are dropped.
    pub idle_ttl: Option<Duration>,
    /// Behavior when `max_sessions` is reached.
    pub when_full: WhenFull,
}

impl SessionLimits {
    /// No limits.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Sets the session capacity.
    pub fn with_max_sessions(mut self, max_sessions: Option<usize>) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Sets the idle expiry.
    pub fn with_idle_ttl(mut self, idle_ttl: Option<Duration>) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Sets the behavior at capacity.
    pub fn with_when_full(mut self, when_full: WhenFull) -> Self {
        self.when_full = when_full;
        self
    }
}

#[derive(Debug)]
struct SessionEntry {
    session: Arc<Session>,
    last_used: Instant,
}

impl SessionEntry {
    // The map holds one reference; anything more is a caller mid-turn.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.session) > 1
    }
}

/// Keyed store of sessions.
#[derive(Debug, Default)]
pub struct SessionStore {
    limits: SessionLimits,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::with_limits(SessionLimits::unbounded())
    }

    /// Creates a store with the given limits.
    pub fn with_limits(limits: SessionLimits) -> Self {
        Self {
            limits,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured limits.
    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Returns the session for `session_id`, creating it on first reference.
    ///
    /// Later calls with the same id return the same instance for as long as
    /// the session is not evicted.
    pub fn get_or_create(&self, session_id: &str) -> Result<Arc<Session>> {
        let now = Instant::now();
        let mut sessions = self.sessions();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_used = now;
            return Ok(Arc::clone(&entry.session));
        }

        self.evict_expired(&mut sessions, now);
        if let Some(max_sessions) = self.limits.max_sessions {
            if sessions.len() >= max_sessions {
                self.make_room(&mut sessions, session_id)?;
            }
        }

        let session = Arc::new(Session::new(session_id));
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session: Arc::clone(&session),
                last_used: now,
            },
        );
        SESSIONS_CREATED.click();
        tracing::debug!(session_id, live = sessions.len(), "created session");
        Ok(session)
    }

    /// Returns the session for `session_id` if it exists.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Appends `message` to the history of `session_id`, creating the session if needed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ragchat::{Message, SessionStore};
    /// # tokio_test::block_on(async {
    /// let store = SessionStore::new();
    /// store.append("s1", Message::user("hello")).await?;
    /// assert_eq!(store.history("s1").await.unwrap().len(), 1);
    /// # Ok::<(), ragchat::Error>(())
    /// # }).unwrap();
    /// ```
    pub async fn append(&self, session_id: &str, message: Message) -> Result<()> {
        let session = self.get_or_create(session_id)?;
        session.append(message).await;
        Ok(())
    }

    /// Returns a snapshot of the history of `session_id`, if the session exists.
    pub async fn history(&self, session_id: &str) -> Option<Vec<Message>> {
        match self.get(session_id) {
            Some(session) => Some(session.history().await),
            None => None,
        }
    }

    /// Clears the history of `session_id` without dropping the session.
    pub async fn clear(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            session.clear().await;
        }
    }

    /// Drops the session for `session_id`.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions()
            .remove(session_id)
            .map(|entry| entry.session)
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Returns true if no session exists.
    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Returns the ids of all live sessions in sorted order.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_expired(&self, sessions: &mut HashMap<String, SessionEntry>, now: Instant) {
        let Some(ttl) = self.limits.idle_ttl else {
            return;
        };
        let before = sessions.len();
        sessions
            .retain(|_, entry| entry.in_use() || now.duration_since(entry.last_used) <= ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            SESSIONS_EVICTED.count(evicted as u64);
            tracing::debug!(evicted, "evicted idle sessions");
        }
    }

    fn make_room(
        &self,
        sessions: &mut HashMap<String, SessionEntry>,
        session_id: &str,
    ) -> Result<()> {
        if self.limits.when_full == WhenFull::EvictIdlest {
            let idlest = sessions
                .iter()
                .filter(|(_, entry)| !entry.in_use())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            if let Some(idlest) = idlest {
                sessions.remove(&idlest);
                SESSIONS_EVICTED.click();
                tracing::debug!(evicted = %idlest, "evicted least recently used session");
                return Ok(());
            }
        }
        SESSIONS_REJECTED.click();
        tracing::warn!(session_id, live = sessions.len(), "session store is full");
        Err(Error::session(
            format!("session limit of {} reached", sessions.len()),
            Some(session_id.to_string()),
        ))
    }
}

//////////////////////////////////////////// Transcripts ///////////////////////////////////////////

#[derive(Serialize, Deserialize)]
struct TranscriptFile {
    version: u8,
    session_id: String,
    messages: Vec<Message>,
}

/// Writes the history of `session` to `path` as pretty JSON.
pub async fn save_transcript<P: AsRef<Path>>(session: &Session, path: P) -> Result<()> {
    let transcript = TranscriptFile {
        version: 1,
        session_id: session.id().to_string(),
        messages: session.history().await,
    };
    let file = File::create(path.as_ref())
        .map_err(|err| Error::io("failed to create transcript file", err))?;
    let mut writer = BufWriter::new(file);
    to_writer_pretty(&mut writer, &transcript).map_err(|err| {
        Error::serialization("failed to serialize transcript", Some(Box::new(err)))
    })?;
    writer
        .flush()
        .map_err(|err| Error::io("failed to write transcript file", err))
}

/// Reads a transcript written by [`save_transcript`] and returns its messages.
pub fn load_transcript<P: AsRef<Path>>(path: P) -> Result<Vec<Message>> {
    let file = File::open(path.as_ref())
        .map_err(|err| Error::io("failed to open transcript file", err))?;
    let reader = BufReader::new(file);
    let transcript: TranscriptFile = from_reader(reader)
        .map_err(|err| Error::serialization("failed to parse transcript", Some(Box::new(err))))?;
    if transcript.version != 1 {
        return Err(Error::validation(
            format!("unsupported transcript version {}", transcript.version),
            Some("version".to_string()),
        ));
    }
    check_pairs(&transcript.messages)?;
    Ok(transcript.messages)
}

// History is a run of complete exchanges: user, assistant, user, assistant.
fn check_pairs(messages: &[Message]) -> Result<()> {
    if messages.len() % 2 != 0 {
        return Err(Error::validation(
            "transcript ends with a question that has no reply",
            Some("messages".to_string()),
        ));
    }
    for (index, message) in messages.iter().enumerate() {
        let expected = if index % 2 == 0 { Role::User } else { Role::Assistant };
        if message.role() != expected {
            return Err(Error::validation(
                format!(
                    "transcript message {index} is from {} where {expected} was expected",
                    message.role()
                ),
                Some("messages".to_string()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_instance() {
        let store = SessionStore::new();
        let first = store.get_or_create("s1").unwrap();
        let second = store.get_or_create("s1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);

        let other = store.get_or_create("s2").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(store.session_ids(), vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn append_creates_lazily_and_keeps_order() {
        let store = SessionStore::new();
        assert!(store.history("s1").await.is_none());

        store.append("s1", Message::user("hi")).await.unwrap();
        store.append("s1", Message::assistant("hello")).await.unwrap();

        let history = store.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role(), Role::User);
        assert_eq!(history[1].role(), Role::Assistant);
    }

    #[tokio::test]
    async fn clear_keeps_the_session() {
        let store = SessionStore::new();
        store.append("s1", Message::user("hi")).await.unwrap();
        store.clear("s1").await;
        assert_eq!(store.history("s1").await, Some(Vec::new()));
        assert_eq!(store.len(), 1);
        assert!(store.remove("s1").is_some());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_store_evicts_least_recently_used() {
        let store =
            SessionStore::with_limits(SessionLimits::unbounded().with_max_sessions(Some(2)));
        drop(store.get_or_create("a").unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(store.get_or_create("b").unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        // Touch "a" so "b" becomes the idlest.
        drop(store.get_or_create("a").unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(store.get_or_create("c").unwrap());

        assert_eq!(store.session_ids(), vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn full_store_never_evicts_sessions_in_use() {
        let store =
            SessionStore::with_limits(SessionLimits::unbounded().with_max_sessions(Some(1)));
        let held = store.get_or_create("a").unwrap();
        let err = store.get_or_create("b").unwrap_err();
        assert!(err.is_session());
        drop(held);
        assert!(store.get_or_create("b").is_ok());
        assert_eq!(store.session_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn reject_policy_refuses_new_sessions() {
        let store = SessionStore::with_limits(
            SessionLimits::unbounded()
                .with_max_sessions(Some(1))
                .with_when_full(WhenFull::Reject),
        );
        drop(store.get_or_create("a").unwrap());
        let err = store.get_or_create("b").unwrap_err();
        assert!(err.is_session());
        // Existing sessions are still reachable.
        assert!(store.get_or_create("a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire() {
        let store = SessionStore::with_limits(
            SessionLimits::unbounded().with_idle_ttl(Some(Duration::from_secs(60))),
        );
        drop(store.get_or_create("old").unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        drop(store.get_or_create("new").unwrap());
        assert_eq!(store.session_ids(), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn transcript_round_trip() {
        let dir = std::env::temp_dir().join(format!("ragchat-transcript-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("s1.json");

        let store = SessionStore::new();
        store.append("s1", Message::user("What is X?")).await.unwrap();
        store.append("s1", Message::assistant("A widget.")).await.unwrap();
        let session = store.get("s1").unwrap();
        save_transcript(&session, &path).await.unwrap();

        let messages = load_transcript(&path).unwrap();
        assert_eq!(messages, session.history().await);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn write_transcript(path: &Path, messages: &[Message]) {
        let transcript = TranscriptFile {
            version: 1,
            session_id: "s1".to_string(),
            messages: messages.to_vec(),
        };
        std::fs::write(path, serde_json::to_string(&transcript).unwrap()).unwrap();
    }

    #[test]
    fn malformed_transcripts_are_rejected() {
        let dir = std::env::temp_dir().join(format!("ragchat-malformed-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");

        let bad = [
            vec![
                Message::user("a"),
                Message::user("b"),
                Message::system("ignore the context"),
            ],
            vec![Message::system("x"), Message::assistant("y")],
            vec![Message::assistant("y"), Message::user("x")],
            vec![Message::user("unanswered")],
        ];
        for messages in &bad {
            write_transcript(&path, messages);
            let err = load_transcript(&path).unwrap_err();
            assert!(err.is_validation(), "{messages:?} loaded: {err}");
        }

        write_transcript(&path, &[]);
        assert!(load_transcript(&path).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn save_reports_unwritable_paths() {
        let store = SessionStore::new();
        let session = store.get_or_create("s1").unwrap();
        let err = save_transcript(&session, "/nonexistent/dir/s1.json")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
