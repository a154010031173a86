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

use std::any::type_name;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::{AppError, AppResult, Shutdown};

/// Processes the tasks of one channel, one at a time.
pub trait PoolHandler<T>: Clone + Send + 'static + Sync {
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// bound of every channel, senders wait when it is full
    pub channel_capacity: usize,
    pub num_channels: usize,
    /// how often the monitor looks for dead workers
    pub monitor_interval: Duration,
    /// how long the monitor waits on each worker handle per round
    pub worker_check_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: num_cpus::get(),
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// A fixed set of task channels, each drained by one dedicated worker.
///
/// Tasks sent to the same channel are handled strictly in send order, which is what keeps
/// every session single threaded. A worker that panics is replaced by the monitor and the
/// replacement keeps draining the same channel.
#[derive(Debug)]
pub struct MultipleChannelWorkerPool<T> {
    channels: Arc<Vec<TaskChannel<T>>>,
    config: WorkerPoolConfig,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

#[derive(Debug)]
struct TaskChannel<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + Debug + 'static> MultipleChannelWorkerPool<T> {
    pub fn new<H: PoolHandler<T>>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) -> Self {
        let config = WorkerPoolConfig {
            num_channels: config.num_channels.max(1),
            ..config
        };
        let channels =
            Self::spawn_channels_with_monitor(config.clone(), notify_shutdown, handler);

        Self {
            channels,
            config,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    /// Queues a task on the given channel, waiting while the channel is full.
    pub async fn send(&self, task: T, channel_id: usize) -> AppResult<()> {
        let channel = self.channels.get(channel_id).ok_or_else(|| {
            AppError::InvalidValue(format!(
                "channel {} out of range, pool has {}",
                channel_id,
                self.channels.len()
            ))
        })?;
        channel.sender.send(task).await?;
        Ok(())
    }

    pub fn pool_config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn spawn_channels_with_monitor<H: PoolHandler<T>>(
        config: WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
    ) -> Arc<Vec<TaskChannel<T>>> {
        let mut workers = Vec::with_capacity(config.num_channels);
        let mut channels = Vec::with_capacity(config.num_channels);

        for id in 0..config.num_channels {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity);
            workers.push(Self::spawn_worker(
                id,
                handler.clone(),
                &notify_shutdown,
                receiver.clone(),
            ));
            channels.push(TaskChannel { sender, receiver });
        }

        let channels = Arc::new(channels);
        Self::spawn_monitor(
            workers,
            channels.clone(),
            notify_shutdown,
            handler,
            config,
        );
        channels
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        notify_shutdown: &broadcast::Sender<()>,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let mut shutdown = Shutdown::subscribe(notify_shutdown);

        let handle = tokio::spawn(async move {
            debug!("session worker {id} started");
            loop {
                tokio::select! {
                    Ok(task) = receiver.recv() => {
                        handler.handle(task).await;
                    }
                    _ = shutdown.recv() => {
                        debug!("session worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        channels: Arc<Vec<TaskChannel<T>>>,
        notify_shutdown: broadcast::Sender<()>,
        handler: H,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::subscribe(&notify_shutdown);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            let join_result = match time::timeout(
                                config.worker_check_timeout,
                                &mut worker.handle,
                            )
                            .await
                            {
                                Ok(join_result) => join_result,
                                Err(_) => {
                                    trace!("session worker {} is running", worker.id);
                                    continue;
                                }
                            };

                            match join_result {
                                Ok(_) => warn!("session worker {} completed unexpectedly", worker.id),
                                Err(err) if err.is_panic() => Self::log_worker_panic(worker.id, err),
                                Err(_) => error!("session worker {} was cancelled", worker.id),
                            }

                            let Some(channel) = channels.get(worker.id) else {
                                error!("no channel for session worker {}", worker.id);
                                continue;
                            };
                            *worker = Self::spawn_worker(
                                worker.id,
                                handler.clone(),
                                &notify_shutdown,
                                channel.receiver.clone(),
                            );
                            warn!("session worker {} restarted", worker.id);
                        }
                    }
                }
            }
            debug!("worker monitor exiting");
        });
    }

    fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
        let payload = err.into_panic();
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            error!("session worker {worker_id} panicked: {message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            error!("session worker {worker_id} panicked: {message}");
        } else {
            error!(
                "session worker {worker_id} panicked with a {} payload",
                get_type_name(&payload)
            );
        }
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
