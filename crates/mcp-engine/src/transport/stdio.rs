use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::Instrument;

use super::{Outbound, OutboundSender, Transport, outbound_channel};
use crate::{
    codec::{self, BatchEnvelope},
    engine::{Engine, encode_outcome},
    error::{EngineError, SessionError, TransportError},
    model::{ErrorData, JsonRpcMessage},
    session::{Session, TransportKind},
};

/// Newline-delimited JSON over a reader and a writer.
pub struct StdioTransport<R, W> {
    reader: FramedRead<R, LinesCodec>,
    writer: W,
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, codec::line_codec()),
            writer,
        }
    }
}

#[cfg(feature = "transport-io")]
pub fn stdio() -> StdioTransport<tokio::io::Stdin, tokio::io::Stdout> {
    StdioTransport::new(tokio::io::stdin(), tokio::io::stdout())
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self) -> Option<Result<String, TransportError>> {
        self.reader
            .next()
            .await
            .map(|line| line.map_err(TransportError::from))
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(frame).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Serve a single client over `transport` until it disconnects or the engine
/// shuts down.
///
/// The first transmission must be `initialize`. Server-initiated requests and
/// notifications are written to the same stream as responses, in queue order.
/// On disconnect the session is terminated and its pending correlations are
/// rejected.
pub async fn serve_stdio<T: Transport>(engine: Engine, mut transport: T) -> Result<(), TransportError> {
    let ct = engine.cancellation_token().child_token();
    let (tx, mut rx) = outbound_channel(engine.config().outbound_buffer);
    let mut session: Option<Arc<Session>> = None;

    let result = loop {
        tokio::select! {
            biased;
            _ = ct.cancelled() => {
                tracing::info!("stdio transport cancelled");
                break Ok(());
            }
            Some(outbound) = rx.recv() => {
                match outbound.encode() {
                    Ok(frame) => {
                        if let Err(error) = transport.send(&frame).await {
                            break Err(error);
                        }
                    }
                    Err(error) => tracing::error!(%error, "failed to encode outbound message"),
                }
            }
            frame = transport.receive() => {
                let frame = match frame {
                    None => {
                        tracing::info!("stdin closed");
                        break Ok(());
                    }
                    Some(Ok(frame)) => frame,
                    Some(Err(TransportError::Codec(LinesCodecError::MaxLineLengthExceeded))) => {
                        tracing::warn!(max = codec::MAX_FRAME_LENGTH, "frame too long");
                        let error = ErrorData::parse_error("frame exceeds maximum length", None);
                        if let Err(error) = send_outcome(&mut transport, Ok(codec::BatchResult::rejected(error))).await {
                            break Err(error);
                        }
                        continue;
                    }
                    Some(Err(error)) => break Err(error),
                };
                if frame.trim().is_empty() {
                    continue;
                }
                let envelope = match codec::decode(frame.as_bytes()) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        tracing::debug!(%error, "malformed frame");
                        if let Err(error) = send_outcome(&mut transport, Err(error.into())).await {
                            break Err(error);
                        }
                        continue;
                    }
                };
                if let Some(established) = session.clone() {
                    spawn_handle(&engine, &established, envelope, tx.clone());
                } else if let Some(frame) = handshake(&engine, &envelope, &tx, &mut session) {
                    if let Err(error) = transport.send(&frame).await {
                        break Err(error);
                    }
                }
            }
        }
    };

    if let Some(session) = session {
        engine.terminate(session.id().as_str());
    }
    if let Err(error) = transport.close().await {
        tracing::debug!(%error, "failed to close stdio transport");
    }
    result
}

fn handshake(
    engine: &Engine,
    envelope: &BatchEnvelope,
    tx: &OutboundSender,
    session: &mut Option<Arc<Session>>,
) -> Option<Vec<u8>> {
    let Some(call) = envelope.as_initialize() else {
        tracing::debug!("transmission before initialize");
        return encode_outcome(Err(SessionError::MissingId.into()));
    };
    let message = match engine.initialize(TransportKind::Stdio, call, Some(tx.clone()), None) {
        Ok((established, response)) => {
            *session = Some(established);
            response
        }
        Err(error) => {
            tracing::warn!(%error, "initialize failed");
            JsonRpcMessage::error(call.id.clone(), error.to_error_data())
        }
    };
    match codec::encode_message(&message) {
        Ok(frame) => Some(frame),
        Err(error) => {
            tracing::error!(%error, "failed to encode initialize response");
            None
        }
    }
}

fn spawn_handle(engine: &Engine, session: &Arc<Session>, envelope: BatchEnvelope, tx: OutboundSender) {
    let span = tracing::debug_span!("transmission", session_id = %session.id(), items = envelope.len());
    let engine = engine.clone();
    let session = session.clone();
    tokio::spawn(
        async move {
            let outcome = engine.handle(&session, envelope).await;
            if let Some(frame) = encode_outcome(outcome) {
                if tx.send(Outbound::Response(frame)).await.is_err() {
                    tracing::debug!("stdio transport closed before response was written");
                }
            }
        }
        .instrument(span),
    );
}

async fn send_outcome<T: Transport>(
    transport: &mut T,
    outcome: Result<codec::BatchResult, EngineError>,
) -> Result<(), TransportError> {
    match encode_outcome(outcome) {
        Some(frame) => transport.send(&frame).await,
        None => Ok(()),
    }
}
