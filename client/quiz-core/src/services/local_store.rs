//! Local buffer of in-progress attempts.
//!
//! Each attempt is one camelCase JSON record under `quiz_session_{quizId}`,
//! kept in two scopes: a durable directory of files and an ephemeral
//! in-process map.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::session_service::SessionStore;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::track_session_operation;
use crate::models::wire::{parse_buffered, BufferedSession};
use crate::models::{
    buffer_key, AttemptState, CompletionData, SessionPatch, SessionStatus, StoredSession,
    BUFFER_KEY_PREFIX,
};

const RECORD_EXTENSION: &str = ".json";

/// Characters kept verbatim in record file names.
const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Raw record text and when it was last written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub raw: String,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait BufferScope: Send + Sync {
    fn name(&self) -> &'static str;
    async fn read(&self, key: &str) -> GatewayResult<Option<RawRecord>>;
    async fn write(&self, key: &str, raw: &str) -> GatewayResult<()>;
    async fn remove(&self, key: &str) -> GatewayResult<()>;
    async fn keys(&self) -> GatewayResult<Vec<String>>;
}

/// One file per key. Writes go to a temp file first and are renamed into
/// place, so a reader never observes a half-written record.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    dir: PathBuf,
}

impl FileBuffer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}",
            utf8_percent_encode(key, FILE_NAME_SET),
            RECORD_EXTENSION
        ))
    }
}

#[async_trait]
impl BufferScope for FileBuffer {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn read(&self, key: &str) -> GatewayResult<Option<RawRecord>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw =
            String::from_utf8(bytes).map_err(|_| GatewayError::CorruptRecord(key.to_string()))?;
        let modified_at = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Some(RawRecord { raw, modified_at }))
    }

    async fn write(&self, key: &str, raw: &str) -> GatewayResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, raw).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(key)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> GatewayResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> GatewayResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(encoded) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(RECORD_EXTENSION))
            else {
                continue;
            };
            match percent_decode_str(encoded).decode_utf8() {
                Ok(key) if key.starts_with(BUFFER_KEY_PREFIX) => keys.push(key.into_owned()),
                _ => {}
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Records that live as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryBuffer {
    records: Arc<RwLock<HashMap<String, RawRecord>>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BufferScope for MemoryBuffer {
    fn name(&self) -> &'static str {
        "ephemeral"
    }

    async fn read(&self, key: &str) -> GatewayResult<Option<RawRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, raw: &str) -> GatewayResult<()> {
        self.records.write().await.insert(
            key.to_string(),
            RawRecord {
                raw: raw.to_string(),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> GatewayResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> GatewayResult<Vec<String>> {
        let mut keys: Vec<String> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Session store over the durable and ephemeral buffer scopes.
#[derive(Clone)]
pub struct LocalSessionStore {
    durable: Arc<dyn BufferScope>,
    ephemeral: Arc<dyn BufferScope>,
    ttl: Duration,
}

impl LocalSessionStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self::with_scopes(
            Arc::new(FileBuffer::new(dir)),
            Arc::new(MemoryBuffer::new()),
            ttl,
        )
    }

    pub fn with_scopes(
        durable: Arc<dyn BufferScope>,
        ephemeral: Arc<dyn BufferScope>,
        ttl: Duration,
    ) -> Self {
        Self {
            durable,
            ephemeral,
            ttl,
        }
    }

    /// Union of the keys of both scopes.
    pub async fn keys(&self) -> GatewayResult<Vec<String>> {
        let mut keys: BTreeSet<String> = self.ephemeral.keys().await?.into_iter().collect();
        match self.durable.keys().await {
            Ok(durable) => keys.extend(durable),
            Err(e) => tracing::warn!("Cannot list durable buffer: {}", e),
        }
        Ok(keys.into_iter().collect())
    }

    /// Reads a record, preferring the durable copy. Unparsable records
    /// yield `GatewayError::CorruptRecord`.
    pub async fn read_record(&self, key: &str) -> GatewayResult<Option<AttemptState>> {
        let record = match self.durable.read(key).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => self.ephemeral.read(key).await?,
            Err(e @ GatewayError::CorruptRecord(_)) => return Err(e),
            Err(e) => {
                tracing::warn!("Durable read of {} failed, using ephemeral copy: {}", key, e);
                self.ephemeral.read(key).await?
            }
        };
        record
            .map(|r| parse_buffered(key, &r.raw, r.modified_at, self.ttl))
            .transpose()
    }

    pub async fn write_record(&self, state: &AttemptState) -> GatewayResult<()> {
        let key = state.buffer_key();
        let raw = serde_json::to_string(&BufferedSession::from_state(state))?;
        self.ephemeral.write(&key, &raw).await?;
        self.durable.write(&key, &raw).await?;
        tracing::debug!(
            "Buffered {} ({} bytes) in {} and {} scopes",
            key,
            raw.len(),
            self.ephemeral.name(),
            self.durable.name()
        );
        Ok(())
    }

    /// Clears `key` from both scopes.
    pub async fn remove_key(&self, key: &str) -> GatewayResult<()> {
        self.ephemeral.remove(key).await?;
        self.durable.remove(key).await
    }

    async fn require(&self, id: &str) -> GatewayResult<AttemptState> {
        self.read_record(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn save(&self, state: &AttemptState) -> GatewayResult<StoredSession> {
        track_session_operation("save", self.name(), async {
            self.write_record(state).await?;
            Ok(StoredSession::local(state.clone(), Utc::now()))
        })
        .await
    }

    async fn load_active(&self) -> GatewayResult<Vec<StoredSession>> {
        track_session_operation("load_active", self.name(), async {
            let now = Utc::now();
            let mut sessions = Vec::new();
            for key in self.keys().await? {
                match self.read_record(&key).await {
                    Ok(Some(state)) if state.is_active() && !state.is_expired_at(now) => {
                        sessions.push(StoredSession::local(state, now));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Skipping buffered session {}: {}", key, e),
                }
            }
            Ok(sessions)
        })
        .await
    }

    async fn get(&self, id: &str) -> GatewayResult<StoredSession> {
        track_session_operation("get", self.name(), async {
            Ok(StoredSession::local(self.require(id).await?, Utc::now()))
        })
        .await
    }

    async fn update(&self, id: &str, patch: &SessionPatch) -> GatewayResult<StoredSession> {
        track_session_operation("update", self.name(), async {
            let mut state = self.require(id).await?;
            patch
                .apply_to(&mut state)
                .map_err(|e| GatewayError::InvalidPayload(format!("{}: {}", id, e)))?;
            self.write_record(&state).await?;
            Ok(StoredSession::local(state, Utc::now()))
        })
        .await
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        track_session_operation("delete", self.name(), self.remove_key(id)).await
    }

    /// Completed attempts are not resumable, so the record is dropped.
    async fn complete(&self, id: &str, data: &CompletionData) -> GatewayResult<StoredSession> {
        track_session_operation("complete", self.name(), async {
            let mut state = self.require(id).await?;
            state.status = SessionStatus::Completed;
            state.score = state.score.max(data.score);
            state.max_streak = state.max_streak.max(data.max_streak);
            state.time_spent = state.time_spent.max(data.time_spent);
            state.answers = data.answers.clone();
            state.revealed = false;
            state.touch(data.completed_at, self.ttl);
            self.remove_key(id).await?;
            Ok(StoredSession::local(state, Utc::now()))
        })
        .await
    }

    /// Reads the quiz's own key. A corrupt record is removed and reported
    /// as absent.
    async fn find_active_for_quiz(&self, quiz_id: &str) -> GatewayResult<Option<StoredSession>> {
        let key = buffer_key(quiz_id);
        let now = Utc::now();
        match self.read_record(&key).await {
            Ok(Some(state)) if state.is_active() && !state.is_expired_at(now) => {
                Ok(Some(StoredSession::local(state, now)))
            }
            Ok(_) => Ok(None),
            Err(GatewayError::CorruptRecord(_)) => {
                tracing::warn!("Removing corrupt buffered session {}", key);
                self.remove_key(&key).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
