#![allow(dead_code)]

use async_trait::async_trait;
use reunion_relay::call::{AudioBlob, CallMetadata, MediaSource, MediaStream};
use reunion_relay::persistence::PersistenceGateway;
use reunion_relay::transport::BoxFuture;
use reunion_relay::{Connector, Credential, CredentialIssuer, Error, Frame, Link, Message, Result, SessionId};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn credential() -> Credential {
    Credential {
        token: "ek_test".to_string(),
        expires_at: chrono::Utc::now().timestamp() + 600,
    }
}

// --- provider ------------------------------------------------------------

pub struct MockLink {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Frame>,
    closes: Arc<AtomicUsize>,
}

impl Link for MockLink {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        let outgoing = self.outgoing.clone();
        Box::pin(async move { outgoing.send(frame).map_err(|_| Error::ConnectionClosed) })
    }

    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(async move { Ok(self.incoming.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Test side of a mocked provider socket.
pub struct Provider {
    /// Frames the provider sends; dropping it closes the socket.
    pub inbound: Option<mpsc::UnboundedSender<Frame>>,
    /// Frames the relay sent to the provider.
    pub outbound: mpsc::UnboundedReceiver<Frame>,
    pub closes: Arc<AtomicUsize>,
    pub connects: Arc<AtomicUsize>,
}

impl Provider {
    pub fn send_json(&self, value: &Value) {
        if let Some(inbound) = &self.inbound {
            inbound.send(Frame::text(value.to_string())).unwrap();
        }
    }

    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    pub async fn next_sent(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("no frame sent to provider")
            .expect("provider link dropped");
        serde_json::from_str(frame.as_text().expect("text frame")).unwrap()
    }

    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut sent = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            if let Some(text) = frame.as_text() {
                sent.push(serde_json::from_str(text).unwrap());
            }
        }
        sent
    }
}

pub enum ConnectorMode {
    Accept,
    Refuse,
    Hang,
}

pub struct MockConnector {
    link: Mutex<Option<MockLink>>,
    mode: ConnectorMode,
    connects: Arc<AtomicUsize>,
}

impl Connector for MockConnector {
    fn connect<'a>(&'a self, _credential: &'a Credential) -> BoxFuture<'a, Result<Box<dyn Link>>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                ConnectorMode::Refuse => Err(Error::Connection("handshake refused".to_string())),
                ConnectorMode::Hang => futures::future::pending().await,
                ConnectorMode::Accept => {
                    let link = self.link.lock().unwrap().take().ok_or(Error::ConnectionClosed)?;
                    Ok(Box::new(link) as Box<dyn Link>)
                }
            }
        })
    }
}

pub fn provider(mode: ConnectorMode) -> (Arc<MockConnector>, Provider) {
    let (inbound, incoming) = mpsc::unbounded_channel();
    let (outgoing, outbound) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    let connects = Arc::new(AtomicUsize::new(0));
    let link = MockLink { incoming, outgoing, closes: Arc::clone(&closes) };
    let connector = MockConnector {
        link: Mutex::new(Some(link)),
        mode,
        connects: Arc::clone(&connects),
    };
    (
        Arc::new(connector),
        Provider { inbound: Some(inbound), outbound, closes, connects },
    )
}

// --- credentials ---------------------------------------------------------

pub struct StaticIssuer {
    pub fail: bool,
    pub issued: AtomicUsize,
}

impl StaticIssuer {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self { fail: false, issued: AtomicUsize::new(0) })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true, issued: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl CredentialIssuer for StaticIssuer {
    async fn issue(&self) -> Result<Credential> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Connection("provider returned 401".to_string()));
        }
        Ok(credential())
    }
}

// --- media ---------------------------------------------------------------

pub enum MediaMode {
    Grant,
    Deny,
    Hang,
}

pub struct MockMedia {
    pub mode: MediaMode,
    pub releases: Arc<AtomicUsize>,
}

impl MockMedia {
    pub fn new(mode: MediaMode) -> Self {
        Self { mode, releases: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&mut self) -> Result<MediaStream> {
        match self.mode {
            MediaMode::Deny => Err(Error::MediaAccess("permission denied".to_string())),
            MediaMode::Hang => futures::future::pending().await,
            MediaMode::Grant => {
                let releases = Arc::clone(&self.releases);
                Ok(MediaStream::new(24_000).on_release(move || {
                    releases.fetch_add(1, Ordering::SeqCst);
                }))
            }
        }
    }
}

// --- persistence ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SavedTranscript {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
    pub duration: Duration,
    pub metadata: CallMetadata,
}

#[derive(Default)]
pub struct RecordingGateway {
    pub transcripts: Mutex<Vec<SavedTranscript>>,
    pub audio: Mutex<Vec<AudioBlob>>,
}

impl RecordingGateway {
    pub fn transcripts(&self) -> Vec<SavedTranscript> {
        self.transcripts.lock().unwrap().clone()
    }

    pub fn audio(&self) -> Vec<AudioBlob> {
        self.audio.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn save_transcript(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        duration: Duration,
        metadata: &CallMetadata,
    ) -> Result<String> {
        self.transcripts.lock().unwrap().push(SavedTranscript {
            session_id: session_id.clone(),
            messages: messages.to_vec(),
            duration,
            metadata: metadata.clone(),
        });
        Ok(format!("transcripts/{session_id}.json"))
    }

    async fn save_audio(&self, session_id: &SessionId, audio: &AudioBlob, _duration: Duration) -> Result<String> {
        self.audio.lock().unwrap().push(audio.clone());
        Ok(format!("audio/{session_id}.wav"))
    }
}
