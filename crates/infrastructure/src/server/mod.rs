pub mod http_handler;
pub mod https;
pub mod pktinfo;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use conduit_dns_application::handler::EntryHandler;

/// Shared state of all listeners: the entry handler, the shutdown signal
/// and the in-flight task set.
///
/// The tracker is injected so that work spawned below the listeners, the
/// upstream racing tasks in particular, lands on the same set; `close`
/// cancels every accept loop and then waits for all of it to drain.
pub struct Server {
    handler: Arc<EntryHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    idle_timeout: Duration,
}

impl Server {
    pub fn new(
        handler: Arc<EntryHandler>,
        idle_timeout: Duration,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            cancel: CancellationToken::new(),
            tracker,
            idle_timeout,
        })
    }

    pub fn handler(&self) -> &Arc<EntryHandler> {
        &self.handler
    }

    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Idempotent. Returns once every in-flight task has finished.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
