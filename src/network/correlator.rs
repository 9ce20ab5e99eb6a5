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

//! Request/reply correlation by message id.
//!
//! Every outbound request that expects an answer registers a one-shot waiter
//! under its message id before the frame is written. The receive loop hands each
//! inbound Response to [`ReplyTable::deliver`], which removes the waiter and fills
//! it. A waiter that times out removes itself, so a reply that shows up later
//! finds nothing and is dropped.
//!
//! Ids come from a 16-bit counter that wraps. A slow peer under sustained load can
//! therefore see an id reused while an older waiter with the same id is still
//! pending. Both stay registered and replies for that id are handed out in
//! registration order, so the older waiter takes the first reply that arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{AppError, AppResult};

/// Never handed out by [`MessageIdSequence`].
pub const RESERVED_MESSAGE_ID: i16 = i16::MAX;

pub type ReplyCallback = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// What a send waits for.
pub enum ReplyMode {
    /// nothing is registered, the send returns once the frame is written
    FireAndForget,
    /// the send returns the reply payload, or `ReplyTimeout`
    Await,
    /// the send returns once written; the callback runs when the reply arrives
    Callback(ReplyCallback),
}

impl ReplyMode {
    pub fn expects_reply(&self) -> bool {
        !matches!(self, ReplyMode::FireAndForget)
    }
}

impl std::fmt::Debug for ReplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyMode::FireAndForget => write!(f, "FireAndForget"),
            ReplyMode::Await => write!(f, "Await"),
            ReplyMode::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Outbound message ids for one session: 0, 1, ..., `i16::MAX - 1`, 0, ...
#[derive(Debug, Default)]
pub struct MessageIdSequence {
    next: i16,
}

impl MessageIdSequence {
    pub fn new() -> Self {
        MessageIdSequence { next: 0 }
    }

    pub fn next_id(&mut self) -> i16 {
        let id = self.next;
        self.next = if id >= RESERVED_MESSAGE_ID - 1 {
            0
        } else {
            id + 1
        };
        id
    }

    pub(crate) fn reset(&mut self) {
        self.next = 0;
    }
}

/// In-flight message id → waiters, oldest first.
#[derive(Debug, Default)]
pub struct ReplyTable {
    waiters: DashMap<i16, VecDeque<(u64, oneshot::Sender<Bytes>)>>,
    next_token: AtomicU64,
}

impl ReplyTable {
    pub fn new() -> Self {
        ReplyTable::default()
    }

    pub fn register(&self, message_id: i16) -> ReplyWaiter {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.waiters.entry(message_id).or_default();
        if !queue.is_empty() {
            trace!(
                "message id {} wrapped onto {} pending waiter(s)",
                message_id,
                queue.len()
            );
        }
        queue.push_back((token, tx));
        ReplyWaiter {
            message_id,
            token,
            rx,
        }
    }

    /// Hands `payload` to the oldest waiter on `message_id`.
    ///
    /// Returns `false` when nobody waits (already timed out, or never asked); the
    /// payload is dropped in that case.
    pub fn deliver(&self, message_id: i16, mut payload: Bytes) -> bool {
        loop {
            let tx = match self.waiters.entry(message_id) {
                Entry::Occupied(mut entry) => {
                    let tx = entry.get_mut().pop_front();
                    if entry.get().is_empty() {
                        entry.remove();
                    }
                    tx
                }
                Entry::Vacant(_) => None,
            };
            match tx {
                Some((_, tx)) => match tx.send(payload) {
                    Ok(()) => return true,
                    // receiver went away without deregistering, try the next one
                    Err(returned) => payload = returned,
                },
                None => return false,
            }
        }
    }

    fn remove(&self, message_id: i16, token: u64) {
        if let Entry::Occupied(mut entry) = self.waiters.entry(message_id) {
            entry.get_mut().retain(|(t, _)| *t != token);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.iter().map(|queue| queue.len()).sum()
    }

    pub fn is_pending(&self, message_id: i16) -> bool {
        self.waiters.contains_key(&message_id)
    }

    pub fn clear(&self) {
        self.waiters.clear();
    }
}

/// One-shot slot for a single reply.
#[derive(Debug)]
pub struct ReplyWaiter {
    message_id: i16,
    token: u64,
    rx: oneshot::Receiver<Bytes>,
}

impl ReplyWaiter {
    pub fn message_id(&self) -> i16 {
        self.message_id
    }

    /// Takes the waiter out of `table` without waiting, e.g. after a failed write.
    pub fn abandon(self, table: &ReplyTable) {
        table.remove(self.message_id, self.token);
    }

    /// Waits for the reply; on timeout the waiter is taken out of `table`.
    pub async fn wait(self, table: &ReplyTable, timeout: Duration) -> AppResult<Bytes> {
        let ReplyWaiter {
            message_id,
            token,
            rx,
        } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // the table was cleared under us
            Ok(Err(_)) => Err(AppError::ReplyTimeout {
                message_id,
                timeout,
            }),
            Err(_) => {
                table.remove(message_id, token);
                Err(AppError::ReplyTimeout {
                    message_id,
                    timeout,
                })
            }
        }
    }
}
