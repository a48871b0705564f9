//! Heartbeat ping/pong liveness monitoring.
//!
//! The monitor only raises a signal when a peer goes quiet. Deciding what
//! happens to the session is left to the session manager.

use crate::channel::ChannelHandle;
use rgate_core::Envelope;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Last-pong timestamp for one bound control channel.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_pong_ms: AtomicU64,
}

impl Liveness {
    /// Starts out as if a pong had just arrived.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    pub fn record_pong(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_pong_ms.fetch_max(ms, Ordering::AcqRel);
    }

    fn last_pong(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_pong_ms.load(Ordering::Acquire))
    }

    pub fn since_last_pong(&self) -> Duration {
        self.last_pong().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Raised when a session's peer stopped answering pings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresponsive {
    pub session_id: String,
    /// Channel the timeout was observed on. A stale signal for a channel
    /// that was already replaced is ignored by the receiver.
    pub channel_id: u64,
}

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No pong within the timeout window.
    TimedOut,
    /// The channel closed or refused a ping.
    ChannelClosed,
    /// Stopped externally.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Ping every `interval` until the peer misses the pong deadline, the
    /// channel goes away, or `cancel` fires.
    pub async fn run(
        &self,
        liveness: &Liveness,
        channel: &ChannelHandle,
        cancel: &CancellationToken,
    ) -> HeartbeatResult {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u64 = 0;

        loop {
            let deadline = liveness.last_pong() + self.timeout;
            tokio::select! {
                () = cancel.cancelled() => return HeartbeatResult::Cancelled,
                () = channel.closed() => return HeartbeatResult::ChannelClosed,
                () = time::sleep_until(deadline) => {
                    // A pong may have landed while we slept.
                    if liveness.since_last_pong() >= self.timeout {
                        return HeartbeatResult::TimedOut;
                    }
                }
                _ = ticker.tick() => {
                    seq += 1;
                    if channel.send(&Envelope::ping(seq)).is_err() {
                        return HeartbeatResult::ChannelClosed;
                    }
                }
            }
        }
    }

    /// Run the loop in the background and report a timeout on `signals`.
    pub fn spawn(
        self,
        session_id: String,
        liveness: Arc<Liveness>,
        channel: ChannelHandle,
        signals: mpsc::UnboundedSender<Unresponsive>,
        cancel: CancellationToken,
    ) -> JoinHandle<HeartbeatResult> {
        tokio::spawn(async move {
            let result = self.run(&liveness, &channel, &cancel).await;
            match result {
                HeartbeatResult::TimedOut => {
                    warn!(
                        session_id = %session_id,
                        silent_ms = liveness.since_last_pong().as_millis() as u64,
                        "peer unresponsive"
                    );
                    let _ = signals.send(Unresponsive {
                        session_id,
                        channel_id: channel.id(),
                    });
                }
                other => debug!(session_id = %session_id, ?other, "heartbeat stopped"),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::{next_envelope, pair};
    use rgate_core::Payload;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(Duration::from_secs(15), Duration::from_secs(45))
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_pongs() {
        let (handle, _events, _client) = pair().await;
        let liveness = Liveness::new();
        let start = Instant::now();
        let result = monitor()
            .run(&liveness, &handle, &CancellationToken::new())
            .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_numbered_pings() {
        let (handle, _events, mut client) = pair().await;
        let liveness = Arc::new(Liveness::new());
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        monitor().spawn("s1".into(), liveness, handle, tx, cancel.clone());

        for expected in 1..=2 {
            let env = next_envelope(&mut client).await;
            match env.payload {
                Payload::Ping(p) => assert_eq!(p.seq, Some(expected)),
                other => panic!("expected ping, got {other:?}"),
            }
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_peer_alive() {
        let (handle, _events, _client) = pair().await;
        let liveness = Arc::new(Liveness::new());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = monitor().spawn("s1".into(), liveness.clone(), handle, tx, cancel.clone());

        for _ in 0..10 {
            time::sleep(Duration::from_secs(20)).await;
            liveness.record_pong();
        }
        assert!(rx.try_recv().is_err());
        cancel.cancel();
        assert_eq!(task.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_signalled_with_channel_id() {
        let (handle, _events, _client) = pair().await;
        let channel_id = handle.id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor().spawn(
            "s1".into(),
            Arc::new(Liveness::new()),
            handle,
            tx,
            CancellationToken::new(),
        );
        let signal = rx.recv().await.unwrap();
        assert_eq!(
            signal,
            Unresponsive {
                session_id: "s1".into(),
                channel_id
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_stops_the_loop() {
        let (handle, _events, _client) = pair().await;
        handle.close();
        let result = monitor()
            .run(&Liveness::new(), &handle, &CancellationToken::new())
            .await;
        assert_eq!(result, HeartbeatResult::ChannelClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_drop_stops_the_loop_before_next_ping() {
        let (handle, _events, client) = pair().await;
        let started = Instant::now();
        drop(client);
        let result = monitor()
            .run(&Liveness::new(), &handle, &CancellationToken::new())
            .await;
        assert_eq!(result, HeartbeatResult::ChannelClosed);
        assert!(started.elapsed() < Duration::from_secs(15));
    }
}
