//! Per-connection session handling.
//!
//! A connection carries one call per bidirectional stream, served in the
//! order the streams arrive. Every frame is a MessagePack [`Message`]
//! behind a 4-byte big-endian length prefix.

use crate::error::{ProtocolError, ServerError, StreamError};
use crate::protocol::MAX_MESSAGE_SIZE;
use crate::server::{ServerMetrics, SessionSlot, SyncServer};
use crate::stream::{OperationSink, OperationSource};
use async_trait::async_trait;
use iroh::endpoint::Connection;
use std::time::Duration;
use sync_types::{
    Credentials, CurrentGroup, Done, ErrorReply, Message, Operation, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A per-connection session.
pub struct Session {
    slot: SessionSlot,
    connection: Connection,
}

impl Session {
    /// Create a session for an accepted connection.
    pub fn new(slot: SessionSlot, connection: Connection) -> Self {
        Self { slot, connection }
    }

    /// Serve streams until the peer closes the connection.
    pub async fn run(self) {
        let remote_id = self.connection.remote_id();
        tracing::info!(remote = %remote_id, "New connection");

        loop {
            let (send, recv) = match self.connection.accept_bi().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(remote = %remote_id, error = %e, "Connection closed");
                    break;
                }
            };

            if let Err(e) = serve_stream(self.slot.server(), recv, send).await {
                tracing::warn!(remote = %remote_id, error = %e, "Stream error");
            }
        }
    }
}

/// Serve one call on one stream and finish the stream.
///
/// Failures of the call itself are answered with an `Error` frame; the
/// returned error only reports that the reply could not be written.
pub async fn serve_stream<R, W>(
    server: &SyncServer,
    recv: R,
    mut send: W,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    let reply = match handle_call(server, recv, &mut send).await {
        Ok(reply) => reply,
        Err(e) => {
            ServerMetrics::incr(&server.metrics().errors_total);
            tracing::warn!(code = %e.code(), error = %e, "Call failed");
            Message::Error(ErrorReply {
                code: e.code(),
                message: e.to_string(),
            })
        }
    };

    write_message(&mut send, &reply).await?;
    send.shutdown()
        .await
        .map_err(|e| StreamError::Send(e.to_string()))
}

async fn handle_call<R, W>(
    server: &SyncServer,
    mut recv: R,
    send: &mut W,
) -> Result<Message, ServerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    let timeout = Duration::from_secs(server.config().limits.request_timeout_secs);
    let request = tokio::time::timeout(timeout, read_message(&mut recv))
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(ProtocolError::from)?;

    let credentials = request
        .credentials()
        .ok_or_else(|| ProtocolError::UnexpectedMessage {
            expected: "SyncData, JoinGroup, LeaveGroup or GetCurrentGroup".to_string(),
            actual: request.name().to_string(),
        })?;
    validate_credentials(credentials, server.config().limits.max_device_token_len)?;

    if let Err(e) = server.rate_limits().check_request(&credentials.device_token) {
        ServerMetrics::incr(&server.metrics().rate_limit_hits);
        return Err(ProtocolError::RateLimited {
            reason: e.to_string(),
        }
        .into());
    }

    let user = server
        .authenticator()
        .authenticate(&credentials.credential)
        .await
        .map_err(ProtocolError::from)?;

    let device = &credentials.device_token;
    let service = server.service();
    let metrics = server.metrics();
    tracing::debug!(device = %device, user = %user, call = request.name(), "Handling call");

    match &request {
        Message::SyncData(_) => {
            let inbound = FramedSource::new(recv, server.config().limits.max_batch_size, timeout);
            let mut outbound = FramedSink::new(send);
            let outcome = service
                .sync_data(device, &user, Box::new(inbound), &mut outbound)
                .await?;

            ServerMetrics::incr(&metrics.syncs_total);
            ServerMetrics::add(&metrics.operations_received, outcome.received);
            ServerMetrics::add(&metrics.operations_delivered, outcome.delivered);
            ServerMetrics::add(&metrics.conflicts_compacted, outcome.compacted);
            Ok(Message::Done(Done {
                delivered: outcome.delivered,
                received: outcome.received,
            }))
        }
        Message::JoinGroup(join) => {
            if join.group.is_blank() {
                return Err(invalid("group is empty"));
            }
            let mut outbound = FramedSink::new(send);
            let outcome = service
                .join_group(device, &user, &join.group, join.merge_data, &mut outbound)
                .await?;

            ServerMetrics::incr(&metrics.joins_total);
            ServerMetrics::add(&metrics.operations_delivered, outcome.delivered);
            Ok(Message::Done(Done {
                delivered: outcome.delivered,
                received: 0,
            }))
        }
        Message::LeaveGroup(leave) => {
            service.leave_group(device, &user, leave.copy_data).await?;
            ServerMetrics::incr(&metrics.leaves_total);
            Ok(Message::Done(Done {
                delivered: 0,
                received: 0,
            }))
        }
        Message::GetCurrentGroup(_) => {
            let group = service.current_group(device, &user).await?;
            ServerMetrics::incr(&metrics.group_queries_total);
            Ok(Message::CurrentGroup(CurrentGroup { group }))
        }
        other => Err(ProtocolError::UnexpectedMessage {
            expected: "a request".to_string(),
            actual: other.name().to_string(),
        }
        .into()),
    }
}

fn validate_credentials(
    credentials: &Credentials,
    max_token_len: usize,
) -> Result<(), ServerError> {
    if credentials.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            client: credentials.version,
            server: PROTOCOL_VERSION,
        }
        .into());
    }
    let token = credentials.device_token.as_str();
    if credentials.device_token.is_blank() {
        return Err(invalid("device token is empty"));
    }
    if token.len() > max_token_len {
        return Err(invalid(&format!(
            "device token too long: {} > {}",
            token.len(),
            max_token_len
        )));
    }
    Ok(())
}

fn invalid(reason: &str) -> ServerError {
    ProtocolError::InvalidMessage {
        reason: reason.to_string(),
    }
    .into()
}

/// Read a length-prefixed message from the stream.
pub async fn read_message<R>(recv: &mut R) -> Result<Message, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await.map_err(read_error)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(StreamError::InvalidMessage(format!(
            "message too large: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await.map_err(read_error)?;

    Message::from_bytes(&buf).map_err(|e| StreamError::InvalidMessage(e.to_string()))
}

/// Write a length-prefixed message to the stream.
pub async fn write_message<W>(send: &mut W, message: &Message) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message
        .to_bytes()
        .map_err(|e| StreamError::Send(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(StreamError::Send(format!(
            "message too large: {} > {MAX_MESSAGE_SIZE}",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| StreamError::Send(e.to_string()))?;
    send.write_all(&bytes)
        .await
        .map_err(|e| StreamError::Send(e.to_string()))?;
    send.flush()
        .await
        .map_err(|e| StreamError::Send(e.to_string()))
}

fn read_error(e: std::io::Error) -> StreamError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        StreamError::Closed
    } else {
        StreamError::Receive(e.to_string())
    }
}

/// Inbound half of a SyncData call: `Batch` frames until `EndOfInput`.
pub struct FramedSource<R> {
    recv: R,
    max_batch: usize,
    idle_timeout: Duration,
}

impl<R> FramedSource<R> {
    /// Read batches of at most `max_batch` operations, waiting at most
    /// `idle_timeout` for each frame.
    pub fn new(recv: R, max_batch: usize, idle_timeout: Duration) -> Self {
        Self {
            recv,
            max_batch,
            idle_timeout,
        }
    }
}

#[async_trait]
impl<R> OperationSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_batch(&mut self) -> Result<Option<Vec<Operation>>, StreamError> {
        let message = tokio::time::timeout(self.idle_timeout, read_message(&mut self.recv))
            .await
            .map_err(|_| StreamError::Receive("timed out waiting for batch".to_string()))??;

        match message {
            Message::Batch(batch) => {
                if batch.operations.len() > self.max_batch {
                    return Err(StreamError::InvalidMessage(format!(
                        "batch too large: {} > {}",
                        batch.operations.len(),
                        self.max_batch
                    )));
                }
                if batch.operations.iter().any(|op| op.statement.trim().is_empty()) {
                    return Err(StreamError::InvalidMessage(
                        "operation statement is empty".to_string(),
                    ));
                }
                Ok(Some(batch.operations))
            }
            Message::EndOfInput => Ok(None),
            other => Err(StreamError::InvalidMessage(format!(
                "expected Batch or EndOfInput, got {}",
                other.name()
            ))),
        }
    }
}

/// Outbound half of a call: one `Operation` frame per operation.
pub struct FramedSink<'a, W> {
    send: &'a mut W,
}

impl<'a, W> FramedSink<'a, W> {
    /// Write operation frames to `send`.
    pub fn new(send: &'a mut W) -> Self {
        Self { send }
    }
}

#[async_trait]
impl<'a, W> OperationSink for FramedSink<'a, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, operation: &Operation) -> Result<(), StreamError> {
        write_message(&mut *self.send, &Message::Operation(operation.clone())).await
    }
}
