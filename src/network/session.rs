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

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::correlator::{MessageIdSequence, ReplyMode, ReplyTable};
use super::frame::{encode_parts, FrameFlags, HEADER_SIZE};
use super::handshake::{self, KeyMaterial, SessionCipher, STATUS_OK};
use crate::service::{EventHub, TransportEvent};
use crate::utils::Pooled;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Invalid,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    Plain,
    NegotiatingKey,
    Encrypted,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

type UserData = Box<dyn Any + Send + Sync>;

/// The reusable part of a session, recycled through the session pool.
#[derive(Default)]
pub struct SessionRecord {
    replies: ReplyTable,
    user_data: Mutex<Option<UserData>>,
}

impl SessionRecord {
    pub fn new() -> Self {
        SessionRecord::default()
    }

    pub fn reset(&mut self) {
        self.replies.clear();
        *self.user_data.get_mut() = None;
    }
}

/// Write half of the socket plus the state only a sender may touch.
///
/// Lives behind the session send lock, so one frame is always written whole
/// before the next one starts.
pub(crate) struct SendHalf {
    writer: Option<OwnedWriteHalf>,
    ids: MessageIdSequence,
    scratch: BytesMut,
}

impl SendHalf {
    fn new(writer: OwnedWriteHalf) -> Self {
        SendHalf {
            writer: Some(writer),
            ids: MessageIdSequence::new(),
            scratch: BytesMut::with_capacity(1024),
        }
    }

    pub(crate) fn next_message_id(&mut self) -> i16 {
        self.ids.next_id()
    }

    /// Header and payload go out in a single write.
    pub(crate) async fn write_frame(
        &mut self,
        session_id: u64,
        flags: FrameFlags,
        message_id: i16,
        payload: &[u8],
    ) -> AppResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(AppError::SessionClosed(session_id))?;
        self.scratch.clear();
        encode_parts(flags, message_id, payload, &mut self.scratch)?;
        writer.write_all(&self.scratch).await?;
        writer.flush().await?;
        trace!(
            "session {} wrote {:?} frame {} ({} payload bytes)",
            session_id,
            flags,
            message_id,
            payload.len()
        );
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                trace!("socket shutdown: {}", e);
            }
        }
        self.ids.reset();
    }
}

/// One logical full-duplex connection.
pub struct Session {
    id: u64,
    role: Role,
    remote_addr: SocketAddr,
    created_at: DateTime<Local>,
    reply_timeout: Duration,
    max_frame_size: usize,
    status: watch::Sender<SessionStatus>,
    sender: tokio::sync::Mutex<SendHalf>,
    record: Pooled<SessionRecord>,
    cipher: OnceLock<SessionCipher>,
    negotiating: AtomicBool,
    // key sent to the peer, installed once the reply to that message id says ok
    staged_key: Mutex<Option<(i16, KeyMaterial)>>,
    admission: Mutex<Option<OwnedSemaphorePermit>>,
    close_token: CancellationToken,
    // why the session is going away, when something other than the read loop decided
    close_cause: Mutex<Option<String>>,
    events: Arc<EventHub>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        role: Role,
        remote_addr: SocketAddr,
        writer: OwnedWriteHalf,
        record: Pooled<SessionRecord>,
        admission: OwnedSemaphorePermit,
        reply_timeout: Duration,
        max_frame_size: usize,
        events: Arc<EventHub>,
    ) -> Session {
        Session {
            id,
            role,
            remote_addr,
            created_at: Local::now(),
            reply_timeout,
            max_frame_size,
            status: watch::Sender::new(SessionStatus::Invalid),
            sender: tokio::sync::Mutex::new(SendHalf::new(writer)),
            record,
            cipher: OnceLock::new(),
            negotiating: AtomicBool::new(false),
            staged_key: Mutex::new(None),
            admission: Mutex::new(Some(admission)),
            close_token: CancellationToken::new(),
            close_cause: Mutex::new(None),
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }
    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    pub fn encryption_state(&self) -> EncryptionState {
        if self.cipher.get().is_some() {
            EncryptionState::Encrypted
        } else if self.negotiating.load(Ordering::Acquire) {
            EncryptionState::NegotiatingKey
        } else {
            EncryptionState::Plain
        }
    }
    pub fn is_encrypted(&self) -> bool {
        self.cipher.get().is_some()
    }

    /// Replies still awaited on this session.
    pub fn pending_replies(&self) -> usize {
        self.record.replies.pending()
    }

    /// Resolves once the session has been closed, whoever closed it.
    pub async fn closed(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|status| *status == SessionStatus::Closed).await;
    }

    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *self.record.user_data.lock() = Some(Box::new(value));
    }

    /// Runs `f` against the user payload if one of type `T` is set.
    pub fn with_user_data<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.record.user_data.lock();
        slot.as_mut()
            .and_then(|data| data.downcast_mut::<T>())
            .map(f)
    }

    pub fn take_user_data<T: Any + Send + Sync>(&self) -> Option<T> {
        let mut slot = self.record.user_data.lock();
        match slot.take().map(|data| data.downcast::<T>()) {
            Some(Ok(data)) => Some(*data),
            Some(Err(other)) => {
                // wrong type requested, leave the payload where it was
                *slot = Some(other);
                None
            }
            None => None,
        }
    }

    /// Fire-and-forget request.
    pub async fn send(self: &Arc<Self>, payload: impl Into<Bytes>) -> AppResult<()> {
        self.send_with(payload, None, ReplyMode::FireAndForget, None)
            .await
            .map(|_| ())
    }

    /// Sends a request and waits for its reply up to the configured reply timeout.
    pub async fn request(self: &Arc<Self>, payload: impl Into<Bytes>) -> AppResult<Bytes> {
        self.request_timeout(payload, self.reply_timeout).await
    }

    pub async fn request_timeout(
        self: &Arc<Self>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> AppResult<Bytes> {
        match self
            .send_with(payload, None, ReplyMode::Await, Some(timeout))
            .await?
        {
            Some(reply) => Ok(reply),
            None => Err(AppError::IllegalStateError(
                "awaited send returned without a reply".into(),
            )),
        }
    }

    /// Sends a request; `on_reply` runs if the reply arrives within `timeout`
    /// (the configured reply timeout when `None`). Nothing runs on timeout.
    pub async fn request_with_callback<F>(
        self: &Arc<Self>,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
        on_reply: F,
    ) -> AppResult<()>
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        self.send_with(payload, None, ReplyMode::Callback(Box::new(on_reply)), timeout)
            .await
            .map(|_| ())
    }

    /// The general send path behind every other send method.
    ///
    /// With `reply_to` set, the frame answers that inbound request (same message
    /// id, Response flag) and `mode` must be fire-and-forget. Otherwise a fresh
    /// message id is drawn. `Await` yields `Some(reply)`; the other modes `None`.
    pub async fn send_with(
        self: &Arc<Self>,
        payload: impl Into<Bytes>,
        reply_to: Option<&InboundMessage>,
        mode: ReplyMode,
        timeout: Option<Duration>,
    ) -> AppResult<Option<Bytes>> {
        let payload = payload.into();
        let timeout = timeout.unwrap_or(self.reply_timeout);
        if reply_to.is_some() && mode.expects_reply() {
            return Err(AppError::InvalidOperation(
                "a reply cannot itself wait for a reply".into(),
            ));
        }
        self.check_frame_size(payload.len())?;
        if !self.is_running() {
            return Err(AppError::SessionClosed(self.id));
        }

        let mut sender = self.sender.lock().await;
        let (flags, message_id) = match reply_to {
            Some(request) => {
                if request.session.id != self.id {
                    return Err(AppError::InvalidOperation(format!(
                        "message {} arrived on session {}, not {}",
                        request.message_id, request.session.id, self.id
                    )));
                }
                if request.replied.load(Ordering::Acquire) {
                    return Err(AppError::AlreadyReplied(request.message_id));
                }
                (FrameFlags::RESPONSE, request.message_id)
            }
            None => (FrameFlags::REQUEST, sender.next_message_id()),
        };

        let body = self.seal(&payload);
        // padding can push a sealed payload over the limit
        self.check_frame_size(body.len())?;
        let waiter = mode
            .expects_reply()
            .then(|| self.record.replies.register(message_id));
        if let Err(e) = sender.write_frame(self.id, flags, message_id, &body).await {
            drop(sender);
            if let Some(waiter) = waiter {
                waiter.abandon(&self.record.replies);
            }
            return Err(self.send_failed(e));
        }
        if let Some(request) = reply_to {
            // set only once the reply is on the wire; the send lock keeps this race free
            request.replied.store(true, Ordering::Release);
        }
        drop(sender);

        match (mode, waiter) {
            (ReplyMode::Await, Some(waiter)) => {
                waiter.wait(&self.record.replies, timeout).await.map(Some)
            }
            (ReplyMode::Callback(on_reply), Some(waiter)) => {
                let session = self.clone();
                tokio::spawn(async move {
                    match waiter.wait(&session.record.replies, timeout).await {
                        Ok(reply) => on_reply(reply),
                        Err(e) => debug!("session {} callback dropped: {}", session.id, e),
                    }
                });
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Runs the client side of the RSA/AES handshake on this session.
    ///
    /// On failure the session is closed.
    pub async fn negotiate_encryption(self: &Arc<Self>) -> AppResult<()> {
        let result = handshake::negotiate(self, self.reply_timeout).await;
        if let Err(e) = &result {
            warn!("session {} handshake failed: {}", self.id, e);
            self.staged_key.lock().take();
            self.negotiating.store(false, Ordering::Release);
            self.fail(e.to_string());
        }
        result
    }

    pub(crate) async fn lock_sender(&self) -> tokio::sync::MutexGuard<'_, SendHalf> {
        self.sender.lock().await
    }

    pub(crate) fn replies(&self) -> &ReplyTable {
        &self.record.replies
    }

    pub(crate) fn begin_negotiation(&self) {
        self.negotiating.store(true, Ordering::Release);
    }

    pub(crate) fn stage_key(&self, message_id: i16, material: KeyMaterial) {
        *self.staged_key.lock() = Some((message_id, material));
    }

    /// Installs the session key. A key that is already set never changes.
    pub(crate) fn install_key(&self, material: KeyMaterial) -> bool {
        let installed = self.cipher.set(SessionCipher::new(material)).is_ok();
        if installed {
            self.negotiating.store(false, Ordering::Release);
            debug!("session {} is now encrypted", self.id);
        }
        installed
    }

    /// Routes an InternalControl response, installing the staged key first when
    /// this is the peer's acceptance of it.
    pub(crate) fn complete_control_reply(&self, message_id: i16, payload: Bytes) {
        let staged = {
            let mut staged = self.staged_key.lock();
            match staged.as_ref() {
                Some((staged_id, _)) if *staged_id == message_id => staged.take(),
                _ => None,
            }
        };
        if let Some((_, material)) = staged {
            if payload[..] == [STATUS_OK] {
                self.install_key(material);
            }
        }
        self.deliver_reply(message_id, payload);
    }

    pub(crate) fn deliver_reply(&self, message_id: i16, payload: Bytes) {
        if !self.record.replies.deliver(message_id, payload) {
            trace!(
                "session {} discarding reply {} nobody waits for",
                self.id,
                message_id
            );
        }
    }

    /// Encrypts an outbound data payload when the session is encrypted.
    pub(crate) fn seal(&self, payload: &Bytes) -> Bytes {
        match self.cipher.get() {
            Some(cipher) => Bytes::from(cipher.encrypt(payload)),
            None => payload.clone(),
        }
    }

    /// Decrypts an inbound data payload when the session is encrypted.
    pub(crate) fn open(&self, payload: Bytes) -> AppResult<Bytes> {
        match self.cipher.get() {
            Some(cipher) => cipher.decrypt(&payload).map(Bytes::from),
            None => Ok(payload),
        }
    }

    fn send_failed(&self, error: AppError) -> AppError {
        if let AppError::SessionClosed(_) = error {
            return error;
        }
        let error = AppError::TransportFailure(format!(
            "write to {} failed: {}",
            self.remote_addr, error
        ));
        self.events.emit(TransportEvent::SendError {
            session_id: self.id,
            error: error.to_string(),
        });
        self.fail(error.to_string());
        error
    }

    fn check_frame_size(&self, payload_len: usize) -> AppResult<()> {
        if HEADER_SIZE + payload_len > self.max_frame_size {
            return Err(AppError::InvalidValue(format!(
                "payload of {} bytes exceeds the frame size limit {}",
                payload_len, self.max_frame_size
            )));
        }
        Ok(())
    }

    /// Asks the receive loop to stop, which then closes the session with `cause`.
    /// The first recorded cause wins.
    pub(crate) fn fail(&self, cause: String) {
        {
            let mut slot = self.close_cause.lock();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.close_token.cancel();
    }

    pub(crate) fn take_close_cause(&self) -> Option<String> {
        self.close_cause.lock().take()
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.close_token
    }

    /// Invalid -> Running. Returns `false` if the session already left Invalid.
    pub(crate) fn mark_running(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Invalid {
                *status = SessionStatus::Running;
                true
            } else {
                false
            }
        })
    }

    /// Moves to Closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Closed {
                false
            } else {
                *status = SessionStatus::Closed;
                true
            }
        })
    }

    pub(crate) fn release_admission(&self) {
        self.admission.lock().take();
    }

    pub(crate) async fn shutdown_socket(&self) {
        self.close_token.cancel();
        self.sender.lock().await.shutdown().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("status", &self.status())
            .field("encryption", &self.encryption_state())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        trace!("session {} dropped", self.id);
    }
}

/// A request received from the peer, handed to data handlers.
pub struct InboundMessage {
    session: Arc<Session>,
    message_id: i16,
    payload: Bytes,
    replied: AtomicBool,
}

impl InboundMessage {
    pub(crate) fn new(session: Arc<Session>, message_id: i16, payload: Bytes) -> Self {
        InboundMessage {
            session,
            message_id,
            payload,
            replied: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
    pub fn message_id(&self) -> i16 {
        self.message_id
    }
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Answers this request. Only the first reply is sent.
    pub async fn reply(&self, payload: impl Into<Bytes>) -> AppResult<()> {
        self.session
            .send_with(payload, Some(self), ReplyMode::FireAndForget, None)
            .await
            .map(|_| ())
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("session", &self.session.id)
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .field("replied", &self.is_replied())
            .finish()
    }
}
