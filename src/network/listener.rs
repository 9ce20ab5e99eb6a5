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

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::service::Shutdown;
use crate::{AppError, AppResult};

/// Called once per accepted connection, on the accept loop's task. It must hand
/// the stream off quickly; the next accept waits for it to return.
pub type AcceptHandler = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

struct Running {
    local_addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Accepts raw TCP connections and passes each to its single registered owner.
pub struct Listener {
    addr: SocketAddr,
    backlog: u32,
    handler: Option<AcceptHandler>,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(addr: SocketAddr, backlog: u32) -> Listener {
        Listener {
            addr,
            backlog,
            handler: None,
            running: Mutex::new(None),
        }
    }

    pub fn on_accept(&mut self, handler: AcceptHandler) {
        self.handler = Some(handler);
    }

    /// Binds and starts accepting. Returns the bound address.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        let handler = self.handler.clone().ok_or(AppError::NoAcceptHandler)?;
        if let Some(running) = self.running.lock().as_ref() {
            return Err(AppError::InvalidOperation(format!(
                "listener already running on {}",
                running.local_addr
            )));
        }

        let listener = self.bind().map_err(|e| {
            let error_msg = format!("Failed to bind to address: {} - Error: {}", self.addr, e);
            error!("{}", error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp listener bound to {}", local_addr);

        let (notify_shutdown, _) = broadcast::channel(1);
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let handle = tokio::spawn(accept_loop(listener, handler, shutdown));

        let mut running = self.running.lock();
        if running.is_some() {
            // lost a race with a concurrent start
            handle.abort();
            return Err(AppError::InvalidOperation("listener already running".into()));
        }
        *running = Some(Running {
            local_addr,
            notify_shutdown,
            handle,
        });
        Ok(local_addr)
    }

    /// Stops the accept loop and closes the listening socket.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.notify_shutdown.send(());
            if let Err(e) = running.handle.await {
                error!("accept loop ended abnormally: {}", e);
            }
            info!("tcp listener on {} stopped", running.local_addr);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn bind(&self) -> std::io::Result<TcpListener> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.addr)?;
        socket.listen(self.backlog)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.handle.abort();
        }
        debug!("tcp listener dropped");
    }
}

async fn accept_loop(listener: TcpListener, handler: AcceptHandler, mut shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            res = accept(&listener) => res,
            _ = shutdown.recv() => {
                debug!("accept loop received shutdown signal");
                return;
            }
        };
        match accepted {
            Ok((socket, remote)) => {
                debug!("accepted connection from {}", remote);
                handler(socket, remote);
            }
            Err(e) => {
                error!(cause = %e, "failed to accept, listener gives up");
                return;
            }
        }
    }
}

/// Retries transient accept errors with exponential backoff.
async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::Accept(format!("accept tcp server error: {}", err)));
                }
                error!("accept error, retrying in {}s: {}", backoff, err);
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
