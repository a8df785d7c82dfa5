//! WebSocket event source
//!
//! Opens the server's execution event stream and exposes it as a stream of
//! raw text frames. Parsing and reconciliation happen in the dispatcher; this
//! module only moves bytes.

use futures::{future, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};
use url::Url;

use super::FrameStream;
use crate::config::TrackerConfig;
use crate::{Result, TrackerError};

/// Connects to the event stream for one client session
#[derive(Debug, Clone)]
pub struct WebSocketEventSource {
    url: Url,
}

impl WebSocketEventSource {
    /// Use an explicit `ws://` or `wss://` URL
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Derive the stream URL from the HTTP server URL
    ///
    /// The scheme is switched to `ws`/`wss`, the configured stream path is
    /// appended, and the client id is passed as the `client_id` query
    /// parameter so the server can attribute events to this session.
    pub fn from_config(config: &TrackerConfig, client_id: &str) -> Result<Self> {
        let mut url = Url::parse(&config.server_url)?;

        match url.scheme() {
            "http" => url.set_scheme("ws").map_err(|_| TrackerError::Configuration {
                message: "Failed to set WebSocket scheme".to_string(),
            })?,
            "https" => url.set_scheme("wss").map_err(|_| TrackerError::Configuration {
                message: "Failed to set secure WebSocket scheme".to_string(),
            })?,
            "ws" | "wss" => {}
            other => {
                return Err(TrackerError::Configuration {
                    message: format!("Unsupported server URL scheme: {}", other),
                })
            }
        }

        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", base_path, config.stream_path.trim_start_matches('/')));
        url.query_pairs_mut().append_pair("client_id", client_id);

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open the connection and return its text frames in arrival order
    ///
    /// Control frames are skipped; a close frame ends the stream; a read
    /// error is yielded once as `TrackerError::Transport`.
    pub async fn connect(&self) -> Result<FrameStream> {
        info!("Connecting to event stream at {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        debug!("Event stream connected");

        Ok(Box::pin(text_frames(ws_stream)))
    }
}

/// Reduce raw WebSocket messages to text frames
///
/// Binary payloads are decoded lossily so undecodable bytes still reach the
/// dispatcher and are counted there as malformed.
fn text_frames<S>(messages: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<Message, WsError>>,
{
    messages
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(TrackerError::from(e))),
            })
        })
}
