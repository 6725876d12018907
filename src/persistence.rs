//! Durable storage for finished calls.

use crate::call::{AudioBlob, CallMetadata, EndReason, SessionId};
use crate::config::{StorageBackend, StorageConfig};
use crate::conversation::{Message, Sender};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const TRANSCRIPT_PREFIX: &str = "family-tree-voice-chats";
pub const AUDIO_PREFIX: &str = "family-tree-voice-audio";
const CALL_TYPE: &str = "voice";

/// Where finished calls go. Failures are reported to the caller, which logs
/// them; nothing is retried.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store the transcript and return its object key.
    ///
    /// # Errors
    /// Returns an error if the record cannot be encoded or written.
    async fn save_transcript(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        duration: Duration,
        metadata: &CallMetadata,
    ) -> Result<String>;

    /// Store the call recording and return its object key.
    ///
    /// # Errors
    /// Returns an error if the blob cannot be written.
    async fn save_audio(&self, session_id: &SessionId, audio: &AudioBlob, duration: Duration) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMetadata {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub end_reason: EndReason,
    pub total_messages: usize,
    pub ai_messages: usize,
    pub user_messages: usize,
    pub diagrams: usize,
}

/// The stored shape of a call transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub call_type: String,
    /// Whole seconds.
    pub call_duration: u64,
    pub metadata: TranscriptMetadata,
    pub messages: Vec<Message>,
}

impl TranscriptRecord {
    #[must_use]
    pub fn new(session_id: &SessionId, messages: &[Message], duration: Duration, metadata: &CallMetadata) -> Self {
        let now = Utc::now();
        let count = |sender: Sender| messages.iter().filter(|m| m.sender == sender).count();
        Self {
            session_id: session_id.to_string(),
            timestamp: now,
            call_type: CALL_TYPE.to_string(),
            call_duration: duration.as_secs(),
            metadata: TranscriptMetadata {
                user_agent: metadata.user_agent.clone(),
                started_at: metadata.started_at,
                timestamp: now,
                end_reason: metadata.end_reason,
                total_messages: messages.len(),
                ai_messages: count(Sender::Ai),
                user_messages: count(Sender::User),
                diagrams: messages.iter().filter(|m| m.diagram.is_some()).count(),
            },
            messages: messages.to_vec(),
        }
    }
}

/// [`PersistenceGateway`] over any `object_store` backend: S3 in
/// production, a local directory or memory otherwise.
#[derive(Debug, Clone)]
pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
    transcript_prefix: String,
    audio_prefix: String,
}

impl ObjectStoreGateway {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            transcript_prefix: TRANSCRIPT_PREFIX.to_string(),
            audio_prefix: AUDIO_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Build the store the configuration asks for.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be initialised.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match &config.backend {
            StorageBackend::S3 { bucket } => {
                tracing::info!("Persisting calls to s3://{bucket}");
                Arc::new(AmazonS3Builder::from_env().with_bucket_name(bucket).build()?)
            }
            StorageBackend::Local { root } => {
                tracing::info!("Persisting calls under {}", root.display());
                std::fs::create_dir_all(root)?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            StorageBackend::Memory => {
                tracing::warn!("No storage configured, calls are kept in memory only");
                Arc::new(InMemory::new())
            }
        };
        Ok(Self::new(store).with_prefixes(&config.transcript_prefix, &config.audio_prefix))
    }

    #[must_use]
    pub fn with_prefixes(mut self, transcripts: &str, audio: &str) -> Self {
        self.transcript_prefix = transcripts.trim_matches('/').to_string();
        self.audio_prefix = audio.trim_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    async fn put(&self, key: String, body: Bytes, content_type: &'static str) -> Result<String> {
        let path = Path::parse(&key).map_err(|err| Error::Persistence(err.to_string()))?;
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.into());
        let options = PutOptions { attributes, ..PutOptions::default() };
        self.store.put_opts(&path, PutPayload::from(body), options).await?;
        Ok(key)
    }
}

#[async_trait]
impl PersistenceGateway for ObjectStoreGateway {
    async fn save_transcript(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        duration: Duration,
        metadata: &CallMetadata,
    ) -> Result<String> {
        let record = TranscriptRecord::new(session_id, messages, duration, metadata);
        let body = serde_json::to_vec_pretty(&record)?;
        let key = object_key(&self.transcript_prefix, session_id, record.timestamp, "json");
        tracing::debug!("Writing {} messages to {key}", messages.len());
        self.put(key, Bytes::from(body), "application/json").await
    }

    async fn save_audio(&self, session_id: &SessionId, audio: &AudioBlob, duration: Duration) -> Result<String> {
        let key = object_key(&self.audio_prefix, session_id, Utc::now(), "wav");
        tracing::debug!("Writing {} bytes ({duration:?}) of audio to {key}", audio.bytes.len());
        self.put(key, audio.bytes.clone(), audio.content_type).await
    }
}

/// `{prefix}/{session}-{epoch millis}.{ext}`
fn object_key(prefix: &str, session_id: &SessionId, at: DateTime<Utc>, extension: &str) -> String {
    format!("{prefix}/{session_id}-{}.{extension}", at.timestamp_millis())
}
