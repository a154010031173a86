pub use id_generator::{SessionIdGenerator, TimerToken, TimerTokenGenerator};
pub use multiple_channel_worker_pool::{MultipleChannelWorkerPool, PoolHandler, WorkerPoolConfig};

mod id_generator;
mod multiple_channel_worker_pool;
