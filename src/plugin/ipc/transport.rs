//! Transport binding for a connection
//!
//! A connection is bound once, at construction, to either the native
//! length-delimited channel or the magic-header [`FrameCodec`]. Messages on both
//! are JSON documents. Outbound traffic goes through a single writer task fed by an
//! unbounded channel, so any task holding the sender can emit messages.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::plugin::ipc::frame::{FrameCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::plugin::traits::PluginError;

/// Boxed byte source for a launched plugin
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink for a launched plugin
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which wire format a connection uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-delimited frames on a dedicated channel
    Native,
    /// Magic-header frames on a shared byte stream
    Framed,
}

impl TransportKind {
    /// Environment variable the launcher uses to tell the plugin its transport
    pub const ENV_VAR: &'static str = "PHANDLER_TRANSPORT";

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Native => "native",
            TransportKind::Framed => "framed",
        }
    }

    /// Read the transport from [`Self::ENV_VAR`], defaulting to native
    pub fn from_env() -> Self {
        std::env::var(Self::ENV_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(TransportKind::Native)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(TransportKind::Native),
            "framed" => Ok(TransportKind::Framed),
            other => Err(PluginError::Config(format!("unknown transport: {}", other))),
        }
    }
}

/// Codec for one side of a connection
#[derive(Debug)]
pub enum WireCodec {
    Native(LengthDelimitedCodec),
    Framed(FrameCodec),
}

impl WireCodec {
    pub fn new(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Native => WireCodec::Native(
                LengthDelimitedCodec::builder()
                    .max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
                    .new_codec(),
            ),
            TransportKind::Framed => WireCodec::Framed(FrameCodec::new()),
        }
    }
}

impl Decoder for WireCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        match self {
            WireCodec::Native(codec) => codec.decode(src),
            WireCodec::Framed(codec) => codec.decode(src).map_err(Into::into),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        match self {
            WireCodec::Native(codec) => codec.decode_eof(src),
            WireCodec::Framed(codec) => codec.decode_eof(src).map_err(Into::into),
        }
    }
}

impl Encoder<Bytes> for WireCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            WireCodec::Native(codec) => codec.encode(item, dst),
            WireCodec::Framed(codec) => codec.encode(item, dst).map_err(Into::into),
        }
    }
}

/// Framed message source
pub type MessageReader<R> = FramedRead<R, WireCodec>;

/// Framed message sink
pub type MessageWriter<W> = FramedWrite<W, WireCodec>;

/// Bind a reader/writer pair to `kind`
pub fn bind<R, W>(reader: R, writer: W, kind: TransportKind) -> (MessageReader<R>, MessageWriter<W>)
where
    R: AsyncRead,
    W: AsyncWrite,
{
    (
        FramedRead::new(reader, WireCodec::new(kind)),
        FramedWrite::new(writer, WireCodec::new(kind)),
    )
}

/// Read and decode the next message
///
/// Returns `None` once the stream is closed.
pub async fn next_message<R, M>(reader: &mut MessageReader<R>) -> Option<Result<M, PluginError>>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    match reader.next().await? {
        Ok(bytes) => Some(serde_json::from_slice(&bytes).map_err(PluginError::from)),
        Err(e) => Some(Err(PluginError::Ipc(format!("Failed to read message: {}", e)))),
    }
}

/// Spawn the writer task for a connection
///
/// Messages sent on the returned channel are serialized and written in order. The
/// task closes the sink and ends when every sender is dropped, or when the sink fails.
pub fn spawn_writer<W, M>(
    mut writer: MessageWriter<W>,
    peer: String,
) -> (mpsc::UnboundedSender<M>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    M: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<M>();
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let bytes = match serde_json::to_vec(&message) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to serialize message for {}: {}", peer, e);
                    continue;
                }
            };
            if let Err(e) = writer.send(Bytes::from(bytes)).await {
                warn!("Failed to send message to {}: {}", peer, e);
                break;
            }
        }
        // Shutting down the sink signals EOF to the peer
        if let Err(e) = writer.close().await {
            debug!("Failed to close channel to {}: {}", peer, e);
        }
        debug!("Writer for {} finished", peer);
    });
    (tx, handle)
}
