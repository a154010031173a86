use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, warn};

use super::machine::SessionEvent;
use super::registry::EventSink;
use crate::utils::TimerToken;
use crate::{PeerAddress, Shutdown};

/// The five timers of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Connect = 0,
    OpenWait = 1,
    KeepWait = 2,
    KeepAlive = 3,
    DeadTimer = 4,
}

impl TimerKind {
    pub const COUNT: usize = 5;
    pub const ALL: [TimerKind; TimerKind::COUNT] = [
        TimerKind::Connect,
        TimerKind::OpenWait,
        TimerKind::KeepWait,
        TimerKind::KeepAlive,
        TimerKind::DeadTimer,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub enum TimerOp {
    Arm {
        peer: PeerAddress,
        kind: TimerKind,
        token: TimerToken,
        after: Duration,
    },
    Cancel {
        token: TimerToken,
    },
}

/// Schedules and cancels timers on the shared timer task. Never blocks.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    ops: mpsc::UnboundedSender<TimerOp>,
}

impl TimerHandle {
    pub fn channel() -> (TimerHandle, mpsc::UnboundedReceiver<TimerOp>) {
        let (ops, rx) = mpsc::unbounded_channel();
        (TimerHandle { ops }, rx)
    }

    pub fn arm(&self, peer: PeerAddress, kind: TimerKind, token: TimerToken, after: Duration) {
        if self
            .ops
            .send(TimerOp::Arm {
                peer,
                kind,
                token,
                after,
            })
            .is_err()
        {
            debug!(%peer, ?kind, "timer service stopped, arm dropped");
        }
    }

    /// Cancelling a token that already fired or was never armed is a no-op.
    pub fn cancel(&self, token: TimerToken) {
        if self.ops.send(TimerOp::Cancel { token }).is_err() {
            debug!(token, "timer service stopped, cancel dropped");
        }
    }
}

/// One task and one `DelayQueue` for the timers of every session.
///
/// An expiry never touches session state. It is submitted to the session's worker as a
/// [`SessionEvent::TimerExpired`] carrying the token it was armed with.
pub struct TimerService;

impl TimerService {
    pub fn start<S: EventSink>(
        mut ops: mpsc::UnboundedReceiver<TimerOp>,
        sink: S,
        notify_shutdown: broadcast::Sender<()>,
    ) -> JoinHandle<()> {
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);

        tokio::spawn(async move {
            let mut delay_queue: DelayQueue<(PeerAddress, TimerKind, TimerToken)> =
                DelayQueue::new();
            let mut keys: HashMap<TimerToken, delay_queue::Key> = HashMap::new();

            loop {
                tokio::select! {
                    Some(op) = ops.recv() => {
                        match op {
                            TimerOp::Arm { peer, kind, token, after } => {
                                let key = delay_queue.insert((peer, kind, token), after);
                                keys.insert(token, key);
                                trace!(%peer, ?kind, token, "timer armed for {:?}", after);
                            }
                            TimerOp::Cancel { token } => {
                                if let Some(key) = keys.remove(&token) {
                                    delay_queue.remove(&key);
                                    trace!(token, "timer cancelled");
                                }
                            }
                        }
                    }
                    Some(expired) = delay_queue.next() => {
                        let (peer, kind, token) = expired.into_inner();
                        keys.remove(&token);
                        trace!(%peer, ?kind, token, "timer expired");
                        if let Err(e) = sink
                            .submit(peer, SessionEvent::TimerExpired { kind, token })
                            .await
                        {
                            warn!(%peer, ?kind, "failed to deliver timer expiry: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("timer service received shutdown signal");
                        break;
                    }
                }
            }
            debug!(pending = keys.len(), "timer service exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::session::SessionTask;

    fn peer() -> PeerAddress {
        PeerAddress::from(([127, 0, 0, 1], 4189))
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn start() -> (
        TimerHandle,
        mpsc::UnboundedReceiver<SessionTask>,
        broadcast::Sender<()>,
    ) {
        let (handle, ops) = TimerHandle::channel();
        let (sink, events) = mpsc::unbounded_channel();
        let (notify_shutdown, _) = broadcast::channel(1);
        TimerService::start(ops, sink, notify_shutdown.clone());
        (handle, events, notify_shutdown)
    }

    fn expired(task: SessionTask) -> (TimerKind, TimerToken) {
        match task.event {
            SessionEvent::TimerExpired { kind, token } => (kind, token),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_at_deadline() {
        let (timers, mut events, _shutdown) = start();
        timers.arm(peer(), TimerKind::OpenWait, 1, Duration::from_secs(60));
        settle().await;

        tokio::time::advance(Duration::from_millis(59_999)).await;
        settle().await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        let task = events.try_recv().unwrap();
        assert_eq!(task.peer, peer());
        assert_eq!(expired(task), (TimerKind::OpenWait, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (timers, mut events, _shutdown) = start();
        timers.arm(peer(), TimerKind::DeadTimer, 5, Duration::from_secs(120));
        timers.arm(peer(), TimerKind::KeepAlive, 6, Duration::from_secs(30));
        timers.cancel(5);
        // unknown tokens are ignored
        timers.cancel(99);
        settle().await;

        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(expired(events.try_recv().unwrap()), (TimerKind::KeepAlive, 6));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiries_come_in_deadline_order() {
        let (timers, mut events, _shutdown) = start();
        timers.arm(peer(), TimerKind::DeadTimer, 1, Duration::from_secs(120));
        timers.arm(peer(), TimerKind::KeepAlive, 2, Duration::from_secs(30));
        timers.arm(peer(), TimerKind::Connect, 3, Duration::from_secs(60));
        settle().await;

        let order: Vec<TimerToken> = vec![
            expired(events.recv().await.unwrap()).1,
            expired(events.recv().await.unwrap()).1,
            expired(events.recv().await.unwrap()).1,
        ];
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let (handle, ops) = TimerHandle::channel();
        let (sink, _events) = mpsc::unbounded_channel::<SessionTask>();
        let (notify_shutdown, _) = broadcast::channel(1);
        let task = TimerService::start(ops, sink, notify_shutdown.clone());
        handle.arm(peer(), TimerKind::OpenWait, 1, Duration::from_secs(60));
        settle().await;

        notify_shutdown.send(()).unwrap();
        task.await.unwrap();
        // arming after shutdown is silently dropped
        handle.arm(peer(), TimerKind::OpenWait, 2, Duration::from_secs(60));
    }
}
