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

//! Wire-level pieces of the transport.
//!
//! - `frame`: the length-prefixed frame layout and its codec
//! - `correlator`: message ids and the table of awaited replies
//! - `handshake`: the RSA to AES session key exchange
//! - `session`: one live connection and its send path
//! - `listener`: the TCP accept loop

pub use correlator::{MessageIdSequence, ReplyCallback, ReplyMode, ReplyTable, ReplyWaiter, RESERVED_MESSAGE_ID};
pub use frame::{Frame, FrameCodec, FrameFlags, HEADER_SIZE, LENGTH_FIELD_SIZE};
pub use handshake::{ControlCode, KeyMaterial, KeyStore, RsaKeyPair, SessionCipher};
pub use listener::{AcceptHandler, Listener};
pub use session::{EncryptionState, InboundMessage, Role, Session, SessionRecord, SessionStatus};

mod correlator;
mod frame;
pub mod handshake;
mod listener;
mod session;
