//! Process configuration read from the environment (and `.env` in `main`).

use crate::call::CallConfig;
use crate::interpreter::tools::session_tools;
use crate::protocol::models::SessionConfig;
use crate::transport::rest::REST_BASE_URL;
use crate::transport::ws::WS_BASE_URL;
use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    S3 { bucket: String },
    Local { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub transcript_prefix: String,
    pub audio_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            transcript_prefix: crate::persistence::TRANSCRIPT_PREFIX.to_string(),
            audio_prefix: crate::persistence::AUDIO_PREFIX.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RelayConfig {
    pub api_key: String,
    /// Session template used when minting credentials.
    pub session: SessionConfig,
    pub ws_url: String,
    pub api_url: String,
    pub token_ttl: Duration,
    pub bind: SocketAddr,
    pub call: CallConfig,
    /// How long the client gets to announce its microphone.
    pub media_timeout: Duration,
    pub storage: StorageConfig,
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.session.model)
            .field("voice", &self.session.voice)
            .field("ws_url", &self.ws_url)
            .field("api_url", &self.api_url)
            .field("bind", &self.bind)
            .field("ceiling", &self.call.ceiling)
            .field("storage", &self.storage.backend)
            .finish_non_exhaustive()
    }
}

impl RelayConfig {
    /// # Errors
    /// Returns [`Error::Config`] if `OPENAI_API_KEY` is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup. Empty
    /// values count as unset.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if `OPENAI_API_KEY` is missing or a value
    /// does not parse.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = var("OPENAI_API_KEY")
            .ok_or_else(|| Error::Config("OPENAI_API_KEY is not set".to_string()))?;

        let mut session = SessionConfig { tools: session_tools()?, ..SessionConfig::default() };
        if let Some(model) = var("REALTIME_MODEL") {
            session.model = model;
        }
        if let Some(voice) = var("REALTIME_VOICE") {
            session.voice = voice;
        }
        if let Some(instructions) = var("REALTIME_INSTRUCTIONS") {
            session.instructions = instructions;
        }

        let host: IpAddr = parse(&var, "RELAY_HOST")?.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let port: u16 = parse(&var, "REALTIME_PROXY_PORT")?.unwrap_or(DEFAULT_PORT);

        let defaults = CallConfig::default();
        let call = CallConfig {
            ceiling: parse(&var, "CALL_CEILING_SECS")?.map_or(defaults.ceiling, Duration::from_secs),
            error_grace: parse(&var, "CALL_ERROR_GRACE_MS")?.map_or(defaults.error_grace, Duration::from_millis),
            ..defaults
        };
        if call.ceiling.is_zero() {
            return Err(Error::Config("CALL_CEILING_SECS must be positive".to_string()));
        }

        let backend = if let Some(bucket) = var("AWS_S3_BUCKET_NAME") {
            StorageBackend::S3 { bucket }
        } else if let Some(root) = var("STORAGE_DIR") {
            StorageBackend::Local { root: PathBuf::from(root) }
        } else {
            StorageBackend::Memory
        };

        Ok(Self {
            api_key,
            session,
            ws_url: var("REALTIME_WS_URL").unwrap_or_else(|| WS_BASE_URL.to_string()),
            api_url: var("REALTIME_API_URL").unwrap_or_else(|| REST_BASE_URL.to_string()),
            token_ttl: parse(&var, "REALTIME_TOKEN_TTL_SECS")?.map_or(DEFAULT_TOKEN_TTL, Duration::from_secs),
            bind: SocketAddr::new(host, port),
            call,
            media_timeout: parse(&var, "MEDIA_TIMEOUT_SECS")?
                .map_or(DEFAULT_MEDIA_TIMEOUT, Duration::from_secs),
            storage: StorageConfig { backend, ..StorageConfig::default() },
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| Error::Config(format!("{key}={raw:?} is invalid: {err}")))
        })
        .transpose()
}
