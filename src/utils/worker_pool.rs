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
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::service::Shutdown;
use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub channel_capacity: usize,
    pub num_workers: usize,
    pub monitor_interval: Duration,
    pub worker_check_timeout: Duration,
}

/// A fixed set of tasks draining one bounded queue.
///
/// A monitor task checks the workers periodically and restarts any that died
/// from a panic. Everything stops on the shutdown broadcast.
pub struct WorkerPool<T>
where
    T: Send + 'static,
{
    request_tx: async_channel::Sender<T>,
    num_workers: usize,
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T> WorkerPool<T>
where
    T: Send + 'static,
{
    pub fn new<F, Fut>(
        name: &'static str,
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        handler: F,
    ) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (request_tx, request_rx) = async_channel::bounded(config.channel_capacity);
        let num_workers = config.num_workers;
        let workers = (0..num_workers)
            .map(|id| spawn_worker(name, id, request_rx.clone(), &notify_shutdown, handler.clone()))
            .collect();
        tokio::spawn(monitor(
            name,
            workers,
            request_rx,
            config,
            notify_shutdown,
            handler,
        ));

        WorkerPool {
            request_tx,
            num_workers,
        }
    }

    /// Queues a job, waiting while the queue is full.
    pub async fn send(&self, request: T) -> AppResult<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }

    pub fn worker_count(&self) -> usize {
        self.num_workers
    }

    pub fn queued(&self) -> usize {
        self.request_tx.len()
    }
}

fn spawn_worker<T, F, Fut>(
    name: &'static str,
    id: usize,
    request_rx: async_channel::Receiver<T>,
    notify_shutdown: &broadcast::Sender<()>,
    handler: F,
) -> Worker
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

    let handle = tokio::spawn(async move {
        debug!("{} worker {} started", name, id);
        loop {
            tokio::select! {
                request = request_rx.recv() => match request {
                    Ok(request) => handler(request).await,
                    Err(_) => break,
                },
                _ = shutdown.recv() => {
                    debug!("{} worker {} shutting down", name, id);
                    break;
                }
            }
        }
    });

    Worker { id, handle }
}

async fn monitor<T, F, Fut>(
    name: &'static str,
    mut workers: Vec<Worker>,
    request_rx: async_channel::Receiver<T>,
    config: WorkerPoolConfig,
    notify_shutdown: broadcast::Sender<()>,
    handler: F,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut interval = time::interval(config.monitor_interval);
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("{} worker monitor received shutdown signal", name);
                break;
            }
            _ = interval.tick() => {}
        }
        for worker in &mut workers {
            if !worker.handle.is_finished() {
                continue;
            }
            let finished = time::timeout(config.worker_check_timeout, &mut worker.handle).await;
            if let Ok(Err(join_error)) = finished {
                if join_error.is_panic() {
                    error!(
                        "{} worker {} panicked: {}",
                        name,
                        worker.id,
                        panic_message(join_error.into_panic())
                    );
                }
                warn!("{} worker {} failed, restarting...", name, worker.id);
                *worker = spawn_worker(
                    name,
                    worker.id,
                    request_rx.clone(),
                    &notify_shutdown,
                    handler.clone(),
                );
            }
        }
    }
    debug!("{} worker monitor exiting", name);
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;

    fn config(num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            channel_capacity: 16,
            num_workers,
            monitor_interval: Duration::from_millis(20),
            worker_check_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn jobs_reach_the_handler() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new("test", config(3), notify_shutdown.clone(), move |job: u32| {
            let done_tx = done_tx.clone();
            async move {
                let _ = done_tx.send(job * 2);
            }
        });
        assert_eq!(pool.worker_count(), 3);
        for job in 1..=5 {
            pool.send(job).await.unwrap();
        }
        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(done_rx.recv().await.unwrap());
        }
        results.sort();
        assert_eq!(results, vec![2, 4, 6, 8, 10]);
        let _ = notify_shutdown.send(());
    }

    #[tokio::test]
    async fn panicking_worker_is_replaced() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let pool = WorkerPool::new("panicky", config(1), notify_shutdown.clone(), move |job: u32| {
            let counter = counter.clone();
            async move {
                if job == 0 {
                    panic!("job zero");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        pool.send(0).await.unwrap();
        pool.send(1).await.unwrap();
        for _ in 0..100 {
            if handled.load(Ordering::SeqCst) == 1 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        let _ = notify_shutdown.send(());
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "non-string panic payload");
    }
}
