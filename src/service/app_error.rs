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

use std::time::Duration;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    /// listener errors
    #[error("listener started without an accept handler")]
    NoAcceptHandler,

    #[error("Accept error = {0}")]
    Accept(String),

    /// transport errors
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("handshake failure: {0}")]
    HandshakeFailure(String),

    #[error("no reply to message {message_id} within {timeout:?}")]
    ReplyTimeout { message_id: i16, timeout: Duration },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("message {0} has already been replied to")]
    AlreadyReplied(i16),

    #[error("session {0} is closed")]
    SessionClosed(u64),
}

impl AppError {
    /// Errors that belong to the caller's business outcome rather than to the
    /// health of the connection.
    pub fn is_reply_timeout(&self) -> bool {
        matches!(self, AppError::ReplyTimeout { .. })
    }

    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, AppError::HandshakeFailure(_))
    }
}
