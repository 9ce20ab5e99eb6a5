// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::codec::Decoder;
use tracing::{debug, error, trace, warn};

use crate::network::handshake;
use crate::network::{Frame, FrameCodec, InboundMessage, Role, Session};
use crate::utils::{panic_message, Pooled};
use crate::{AppError, AppResult};

use super::config::EncryptionMode;
use super::transport::TransportInner;

/// Per-connection read state, recycled through the I/O context pool.
#[derive(Debug)]
pub struct IoContext {
    chunk: Vec<u8>,
    bytes_received: u64,
    frames_decoded: u64,
}

impl IoContext {
    pub fn new(read_size: usize) -> IoContext {
        IoContext {
            chunk: vec![0; read_size],
            bytes_received: 0,
            frames_decoded: 0,
        }
    }

    pub fn reset(&mut self) {
        self.bytes_received = 0;
        self.frames_decoded = 0;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

/// An inbound request waiting for a worker.
#[derive(Debug)]
pub struct DispatchTask {
    message: Arc<InboundMessage>,
}

/// Owns the read half of one session and everything decoded from it.
pub(crate) struct ConnectionHandler {
    session: Arc<Session>,
    reader: OwnedReadHalf,
    buffer: Pooled<BytesMut>,
    io: Pooled<IoContext>,
    codec: FrameCodec,
    transport: Arc<TransportInner>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        session: Arc<Session>,
        reader: OwnedReadHalf,
        buffer: Pooled<BytesMut>,
        io: Pooled<IoContext>,
        transport: Arc<TransportInner>,
    ) -> ConnectionHandler {
        let codec = FrameCodec::new(transport.config.network.max_frame_size);
        ConnectionHandler {
            session,
            reader,
            buffer,
            io,
            codec,
            transport,
        }
    }

    /// Reads until the peer goes away or the session is closed or fails, then
    /// closes the session and hands the pooled buffers back.
    pub(crate) async fn run(mut self) {
        let cause = match self.read_loop().await {
            Ok(()) => self.session.take_close_cause(),
            Err(e) => {
                warn!(
                    "session {} with {} failed: {}",
                    self.session.id(),
                    self.session.remote_addr(),
                    e
                );
                Some(e.to_string())
            }
        };
        debug!(
            "session {} read loop done, {} bytes in {} frames",
            self.session.id(),
            self.io.bytes_received(),
            self.io.frames_decoded()
        );
        self.transport.end_session(&self.session, cause).await;

        let limit = self.transport.config.network.conn_read_buffer_size * BUFFER_GROWTH_LIMIT;
        if !recycle_buffer(self.buffer, limit) {
            trace!(
                "session {} receive buffer outgrew {} bytes, not recycled",
                self.session.id(),
                limit
            );
        }
    }

    async fn read_loop(&mut self) -> AppResult<()> {
        let close_token = self.session.close_token().clone();
        let session_id = self.session.id();
        loop {
            while let Some(frame) = self.codec.decode(&mut self.buffer)? {
                self.io.frames_decoded += 1;
                self.dispatch(frame).await?;
            }

            let io = &mut *self.io;
            let read = tokio::select! {
                res = self.reader.read(&mut io.chunk) => res?,
                _ = close_token.cancelled() => {
                    debug!("session {} read loop cancelled", session_id);
                    return Ok(());
                }
            };
            if read == 0 {
                // peer closed; a half-received frame means the stream was cut
                return if self.buffer.is_empty() {
                    Ok(())
                } else {
                    Err(AppError::TransportFailure(format!(
                        "connection reset by peer with {} bytes of a frame buffered",
                        self.buffer.len()
                    )))
                };
            }
            io.bytes_received += read as u64;
            self.buffer.extend_from_slice(&io.chunk[..read]);
        }
    }

    async fn dispatch(&self, frame: Frame) -> AppResult<()> {
        let session = &self.session;
        trace!(
            "session {} received {:?} frame {} ({} bytes)",
            session.id(),
            frame.flags,
            frame.message_id,
            frame.payload.len()
        );

        if frame.flags.is_control() {
            return if frame.flags.is_response() {
                session.complete_control_reply(frame.message_id, frame.payload);
                Ok(())
            } else if frame.flags.is_request() && session.role() == Role::Server {
                handshake::answer(session, &self.transport.keys, frame).await
            } else {
                Err(AppError::ProtocolViolation(format!(
                    "unexpected control frame {:?} on a {:?} session",
                    frame.flags,
                    session.role()
                )))
            };
        }

        if self.transport.keys.mode() == EncryptionMode::Required
            && session.role() == Role::Server
            && !session.is_encrypted()
        {
            return Err(AppError::ProtocolViolation(
                "plaintext data frame on a session that requires encryption".into(),
            ));
        }
        let payload = session.open(frame.payload)?;

        if frame.flags.is_response() {
            session.deliver_reply(frame.message_id, payload);
            Ok(())
        } else if frame.flags.is_request() {
            if !self.transport.has_data_handlers() {
                trace!(
                    "session {} dropping request {}, no data handler registered",
                    session.id(),
                    frame.message_id
                );
                return Ok(());
            }
            let message = Arc::new(InboundMessage::new(
                session.clone(),
                frame.message_id,
                payload,
            ));
            self.transport.dispatcher.send(DispatchTask { message }).await
        } else {
            Err(AppError::ProtocolViolation(format!(
                "data frame {} carries neither request nor response flag",
                frame.message_id
            )))
        }
    }
}

/// Accumulators that grew past this many read sizes are dropped instead of pooled.
const BUFFER_GROWTH_LIMIT: usize = 4;

/// Returns `buffer` to its pool unless it grew past `limit` bytes.
fn recycle_buffer(buffer: Pooled<BytesMut>, limit: usize) -> bool {
    if buffer.capacity() > limit {
        drop(buffer.detach());
        false
    } else {
        buffer.release();
        true
    }
}

/// Worker body: waits for a handler slot, then runs the handler chain for one
/// inbound request on its own task, which holds the slot until the chain ends.
pub(crate) async fn process_request(transport: Weak<TransportInner>, task: DispatchTask) {
    let transport = match transport.upgrade() {
        Some(transport) => transport,
        None => return,
    };
    let slot = match transport.admission.acquire_handler_slot().await {
        Ok(slot) => slot,
        Err(e) => {
            error!("no handler slot for message {}: {}", task.message.message_id(), e);
            return;
        }
    };
    tokio::spawn(async move {
        let _slot = slot;
        run_handlers(&transport, task).await;
    });
}

/// Runs every data handler in registration order. A failing or panicking
/// handler closes the request's session and stops the chain.
async fn run_handlers(transport: &TransportInner, task: DispatchTask) {
    let handlers = transport.data_handlers.read().clone();
    for handler in handlers {
        let error = match tokio::spawn(handler(task.message.clone())).await {
            Ok(Ok(())) => continue,
            Ok(Err(AppError::HandlerError(message))) => AppError::HandlerError(message),
            Ok(Err(e)) => AppError::HandlerError(e.to_string()),
            Err(join_error) if join_error.is_panic() => AppError::HandlerError(format!(
                "handler panicked: {}",
                panic_message(join_error.into_panic())
            )),
            Err(join_error) => AppError::HandlerError(join_error.to_string()),
        };
        let session = task.message.session();
        error!(
            "session {} message {}: {}, closing session",
            session.id(),
            task.message.message_id(),
            error
        );
        transport
            .end_session(session, Some(error.to_string()))
            .await;
        break;
    }
}
