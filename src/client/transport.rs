//! Client side of the envelope transport.
//!
//! One writer task drains an mpsc channel into the socket, so envelopes
//! leave in the order they were sent. One reader task parses inbound text
//! frames; malformed frames are logged and dropped.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{RejectReason, VoiceError};
use crate::voice::events::{audio_envelopes, Envelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHANNEL_CAPACITY: usize = 256;

/// Connect URL for `session_id`: `endpoint?session_id=..&token=..`.
pub fn connect_url(endpoint: &str, session_id: &str, credential: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{endpoint}{sep}session_id={}&token={}",
        urlencoding::encode(session_id),
        urlencoding::encode(credential)
    )
}

#[derive(Debug)]
enum Outbound {
    Envelope(Envelope),
    Close,
}

pub struct TransportClient {
    session_id: String,
    outbound_tx: mpsc::Sender<Outbound>,
    audio_seq: u64,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl TransportClient {
    /// Open the connection. A refused upgrade surfaces as
    /// [`VoiceError::TransportRejected`] carrying the HTTP status.
    pub async fn connect(
        endpoint: &str,
        session_id: &str,
        credential: &str,
    ) -> Result<(Self, mpsc::Receiver<Envelope>), VoiceError> {
        let url = connect_url(endpoint, session_id, credential);
        tracing::info!(session_id = %session_id, endpoint = %endpoint, "Connecting voice transport");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => {
                    let status = response.status().as_u16();
                    tracing::warn!(session_id = %session_id, status, "Voice connection rejected");
                    VoiceError::TransportRejected(RejectReason::Status(status))
                }
                other => VoiceError::Transport(other.to_string()),
            })?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let writer = tokio::spawn(writer_loop(outbound_rx, ws_sender, session_id.to_string()));
        let reader = tokio::spawn(reader_loop(ws_receiver, inbound_tx, session_id.to_string()));

        Ok((
            Self {
                session_id: session_id.to_string(),
                outbound_tx,
                audio_seq: 0,
                writer,
                reader,
            },
            inbound_rx,
        ))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), VoiceError> {
        self.outbound_tx
            .send(Outbound::Envelope(envelope))
            .await
            .map_err(|_| VoiceError::Transport("connection closed".into()))
    }

    /// Send an utterance as one or more `audio_chunk` envelopes.
    pub async fn send_audio(&mut self, audio: &[u8]) -> Result<usize, VoiceError> {
        let envelopes = audio_envelopes(audio, &mut self.audio_seq);
        let count = envelopes.len();
        for envelope in envelopes {
            self.send(envelope).await?;
        }
        Ok(count)
    }

    /// Close the socket after everything already queued has been written.
    pub async fn close(self) {
        let _ = self.outbound_tx.send(Outbound::Close).await;
        if let Err(e) = self.writer.await {
            tracing::debug!(session_id = %self.session_id, error = %e, "Transport writer ended abnormally");
        }
        self.reader.abort();
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut ws_sender: SplitSink<WsStream, WsMessage>,
    session_id: String,
) {
    while let Some(msg) = rx.recv().await {
        let envelope = match msg {
            Outbound::Envelope(envelope) => envelope,
            Outbound::Close => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
        };
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to encode envelope");
                continue;
            }
        };
        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
            tracing::warn!(session_id = %session_id, "Voice transport send failed, closing writer");
            break;
        }
    }
    tracing::debug!(session_id = %session_id, "Voice transport writer terminated");
}

async fn reader_loop(
    mut ws_receiver: SplitStream<WsStream>,
    inbound_tx: mpsc::Sender<Envelope>,
    session_id: String,
) {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => match Envelope::parse(text.as_str()) {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Dropping malformed envelope");
                }
            },
            Ok(WsMessage::Binary(data)) => {
                tracing::warn!(
                    session_id = %session_id,
                    bytes = data.len(),
                    "Dropping unexpected binary frame"
                );
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(session_id = %session_id, close_frame = ?frame, "Voice transport closed by server");
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Voice transport error");
                break;
            }
        }
    }
    tracing::debug!(session_id = %session_id, "Voice transport reader terminated");
}
