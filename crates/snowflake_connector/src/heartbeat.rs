//! Periodic session heartbeat.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{Instrument, debug, debug_span, warn};

use crate::session::SessionManager;

/// Keeps a session alive by heartbeating it on an interval.
#[derive(Debug)]
pub struct Heartbeat {
    session: Arc<SessionManager>,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(session: Arc<SessionManager>, interval: Duration) -> Self {
        Heartbeat { session, interval }
    }

    /// Spawn the heartbeat loop.
    ///
    /// The loop runs until [`HeartbeatHandle::stop`] is called or the handle
    /// is dropped.
    pub fn start(self) -> HeartbeatHandle {
        let (tx, rx) = oneshot::channel();
        let span = debug_span!("session_heartbeat", interval = ?self.interval);
        let task = tokio::spawn(self.run(rx).instrument(span));
        debug!("heartbeat started");
        HeartbeatHandle {
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = interval_with_skipped_ticks(self.interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {}
            }

            // Don't let a slow heartbeat hold up shutdown.
            tokio::select! {
                _ = &mut shutdown => break,
                res = self.session.heartbeat() => {
                    if let Err(e) = res {
                        warn!(%e, "failed to heartbeat");
                    }
                }
            }
        }

        debug!("heartbeat stopped");
    }
}

/// Owner of a running heartbeat loop.
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            // Receiver is gone only if the loop already exited.
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(%e, "heartbeat task failed");
            }
        }
    }
}

// Dropping the handle drops the sender, which ends the loop on its next
// select.

/// Create an interval with skipped ticks whose first tick is one period out.
fn interval_with_skipped_ticks(dur: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + dur, dur);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::session::tests::{test_client, test_tokens};
    use crate::testutil::{FnTransport, envelope};

    const HEARTBEAT: &str = "/session/heartbeat";

    #[tokio::test(start_paused = true)]
    async fn beats_on_interval_until_stopped() {
        let transport = Arc::new(FnTransport::new(|_| envelope(json!({}), None, true)));
        let session = Arc::new(SessionManager::new(
            test_client(transport.clone()),
            test_tokens("tok"),
        ));

        let handle = Heartbeat::new(session, Duration::from_secs(10)).start();
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(3, transport.requests_to(HEARTBEAT).len());

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(3, transport.requests_to(HEARTBEAT).len());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let transport = Arc::new(FnTransport::new(|_| {
            envelope(Value::Null, Some("000001"), false)
        }));
        let session = Arc::new(SessionManager::new(
            test_client(transport.clone()),
            test_tokens("tok"),
        ));

        let handle = Heartbeat::new(session, Duration::from_secs(10)).start();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(2, transport.requests_to(HEARTBEAT).len());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_ends_loop() {
        let transport = Arc::new(FnTransport::new(|_| envelope(json!({}), None, true)));
        let session = Arc::new(SessionManager::new(
            test_client(transport.clone()),
            test_tokens("tok"),
        ));

        let handle = Heartbeat::new(session.clone(), Duration::from_secs(10)).start();
        drop(handle);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(transport.requests_to(HEARTBEAT).is_empty());
        // The loop released its reference to the session.
        assert_eq!(1, Arc::strong_count(&session));
    }
}
