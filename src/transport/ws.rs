use super::{BoxFuture, Connector, Credential, Frame, Link};
use crate::error::{Error, Result};
use crate::protocol::models::DEFAULT_MODEL;
use crate::{TRACE_LOG_MAX_BYTES, safe_truncate};
use futures::{SinkExt, StreamExt};
use reqwest::header::{AUTHORIZATION, HeaderName, HeaderValue};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

pub const WS_BASE_URL: &str = "wss://api.openai.com/v1/realtime";

const OPENAI_BETA: &str = "openai-beta";
const OPENAI_BETA_REALTIME: &str = "realtime=v1";

#[derive(Debug)]
pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    pub(crate) const fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self(stream)
    }
}

impl futures::Stream for WsStream {
    type Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.0).poll_next(cx)
    }
}

impl futures::Sink<Message> for WsStream {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: Message,
    ) -> std::result::Result<(), Self::Error> {
        std::pin::Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Establish a WebSocket connection to the Realtime API using an ephemeral credential.
///
/// # Errors
/// Returns an error if the URL or token is invalid, or if the handshake fails.
pub async fn connect(base_url: &Url, model: &str, credential: &Credential) -> Result<WsStream> {
    let mut url = base_url.clone();
    url.query_pairs_mut().append_pair("model", model);

    let auth_header = HeaderValue::from_str(&format!("Bearer {}", credential.token))?;

    let mut req = url.as_str().into_client_request()?;
    let h = req.headers_mut();
    h.insert(AUTHORIZATION, auth_header);
    h.insert(
        HeaderName::from_static(OPENAI_BETA),
        HeaderValue::from_static(OPENAI_BETA_REALTIME),
    );
    let (ws_stream, _) = connect_async(req).await?;

    tracing::info!("Connected to OpenAI Realtime ({model})");

    Ok(WsStream::new(ws_stream))
}

/// Provider link over a live WebSocket.
pub struct WsLink {
    stream: WsStream,
}

impl WsLink {
    #[must_use]
    pub const fn new(stream: WsStream) -> Self {
        Self { stream }
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received frame: {}", safe_truncate(text.as_str(), TRACE_LOG_MAX_BYTES));
                    return Ok(Some(Frame::Text(text.as_str().to_owned())));
                }
                Message::Binary(data) => return Ok(Some(Frame::Binary(data))),
                Message::Close(_) => {
                    tracing::info!("WebSocket connection closed by server");
                    return Ok(None);
                }
                Message::Ping(payload) => {
                    tracing::debug!("Received Ping, sending Pong");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Pong(_) | Message::Frame(_) => (),
            }
        }
        Ok(None)
    }
}

impl Link for WsLink {
    fn send(&mut self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let message = match frame {
                Frame::Text(text) => {
                    tracing::trace!("Sending frame: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    Message::Text(text.into())
                }
                Frame::Binary(data) => Message::Binary(data),
            };
            self.stream.send(message).await?;
            Ok(())
        })
    }

    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(self.recv())
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.stream.close().await {
                Ok(())
                | Err(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
                ) => Ok(()),
                Err(err) => Err(Error::from(err)),
            }
        })
    }
}

/// Opens [`WsLink`]s against the provider endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: Url,
    model: String,
}

impl WsConnector {
    /// # Errors
    /// Returns an error if `base_url` is not a valid URL.
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: &str, model: Option<&str>) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, Result<Box<dyn Link>>> {
        Box::pin(async move {
            let stream = connect(&self.base_url, &self.model, credential).await?;
            Ok(Box::new(WsLink::new(stream)) as Box<dyn Link>)
        })
    }
}
