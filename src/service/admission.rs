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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;

use crate::{AppError, AppResult};

/// Two independent counting limiters: open sessions, and application handlers
/// running at the same time across all sessions.
#[derive(Debug)]
pub struct AdmissionController {
    limit_connections: Arc<Semaphore>,
    limit_handlers: Arc<Semaphore>,
    admission_timeout: Duration,
    live_connections: AtomicUsize,
}

impl AdmissionController {
    pub fn new(
        max_connections: usize,
        max_concurrent_handlers: usize,
        admission_timeout: Duration,
    ) -> Self {
        AdmissionController {
            limit_connections: Arc::new(Semaphore::new(max_connections)),
            limit_handlers: Arc::new(Semaphore::new(max_concurrent_handlers)),
            admission_timeout,
            live_connections: AtomicUsize::new(0),
        }
    }

    /// Waits up to the admission timeout for a connection slot.
    ///
    /// The slot is held by the returned permit; dropping it frees the slot.
    pub async fn admit(&self) -> AppResult<OwnedSemaphorePermit> {
        match time::timeout(
            self.admission_timeout,
            self.limit_connections.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => {
                self.live_connections.fetch_add(1, Ordering::AcqRel);
                Ok(permit)
            }
            Ok(Err(_)) => Err(AppError::IllegalStateError(
                "connection limiter closed".into(),
            )),
            Err(_) => Err(AppError::AdmissionRejected(format!(
                "no connection slot freed up within {:?}",
                self.admission_timeout
            ))),
        }
    }

    /// Called once per admitted connection when it ends.
    pub fn connection_closed(&self) {
        self.live_connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Waits for a handler slot. The permit can move into the task running the
    /// handlers, so the slot stays taken for as long as they run.
    pub async fn acquire_handler_slot(&self) -> AppResult<OwnedSemaphorePermit> {
        self.limit_handlers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::IllegalStateError("handler limiter closed".into()))
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    pub fn available_connection_slots(&self) -> usize {
        self.limit_connections.available_permits()
    }

    pub fn available_handler_slots(&self) -> usize {
        self.limit_handlers.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_rejects_after_timeout() {
        let admission = AdmissionController::new(2, 1, Duration::from_millis(2000));
        let first = admission.admit().await.unwrap();
        let _second = admission.admit().await.unwrap();
        assert_eq!(admission.live_connections(), 2);
        assert_eq!(admission.available_connection_slots(), 0);

        let started = time::Instant::now();
        let rejected = admission.admit().await;
        assert!(matches!(rejected, Err(AppError::AdmissionRejected(_))));
        assert!(started.elapsed() >= Duration::from_millis(2000));

        drop(first);
        admission.connection_closed();
        assert!(admission.admit().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_connection_gets_slot_freed_in_time() {
        let admission = Arc::new(AdmissionController::new(1, 1, Duration::from_millis(500)));
        let held = admission.admit().await.unwrap();
        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.admit().await.map(|_| ()) })
        };
        time::sleep(Duration::from_millis(100)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn handler_slots_are_bounded() {
        let admission = AdmissionController::new(1, 2, Duration::from_millis(10));
        let a = admission.acquire_handler_slot().await.unwrap();
        let _b = admission.acquire_handler_slot().await.unwrap();
        assert_eq!(admission.available_handler_slots(), 0);
        let moved = tokio::spawn(async move {
            let _a = a;
            time::sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(admission.available_handler_slots(), 0);
        moved.await.unwrap();
        assert_eq!(admission.available_handler_slots(), 1);
    }
}
