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

mod network;
mod service;
mod utils;

pub use network::handshake;
pub use network::{
    AcceptHandler, EncryptionState, Frame, FrameCodec, FrameFlags, InboundMessage, Listener,
    ReplyMode, Role, RsaKeyPair, Session, SessionStatus, RESERVED_MESSAGE_ID,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, EncryptionMode, LogGuard, Shutdown,
    Transport, TransportConfig, TransportEvent,
};
pub use utils::{Pool, Pooled};
