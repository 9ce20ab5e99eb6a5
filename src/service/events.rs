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

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::network::Session;

#[derive(Clone)]
pub enum TransportEvent {
    SessionEstablished(Arc<Session>),
    /// `cause` is `None` for a graceful close
    SessionEnded {
        session: Arc<Session>,
        cause: Option<String>,
    },
    SendError {
        session_id: u64,
        error: String,
    },
    AdmissionRejected {
        remote: SocketAddr,
    },
    PoolOverflow {
        pool: String,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::SessionEstablished(session) => {
                write!(f, "SessionEstablished({})", session.id())
            }
            TransportEvent::SessionEnded { session, cause } => {
                write!(f, "SessionEnded({}, {:?})", session.id(), cause)
            }
            TransportEvent::SendError { session_id, error } => {
                write!(f, "SendError({}, {})", session_id, error)
            }
            TransportEvent::AdmissionRejected { remote } => {
                write!(f, "AdmissionRejected({})", remote)
            }
            TransportEvent::PoolOverflow { pool } => write!(f, "PoolOverflow({})", pool),
        }
    }
}

pub type EventListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Registered event listeners; emission is skipped entirely when none are registered.
#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<Vec<EventListener>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn emit(&self, event: TransportEvent) {
        // listeners may subscribe further listeners, so call them outside the lock
        let listeners: Vec<EventListener> = {
            let guard = self.listeners.read();
            if guard.is_empty() {
                return;
            }
            guard.clone()
        };
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
