//! Two-stage termination: first signal drains, second signal exits

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const FORCED: u8 = 2;

/// Outcome of raising the terminate flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// First request: stop dispatching and drain in-flight work
    Drain,
    /// Repeated request: exit immediately
    Force,
}

/// Tri-state terminate flag shared by the dispatch loop and the signal listener
#[derive(Debug, Default)]
pub struct TerminateFlag {
    state: AtomicU8,
    notify: Notify,
}

impl TerminateFlag {
    /// Create a flag in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag, returning which stage was reached
    pub fn escalate(&self) -> Escalation {
        let escalation = match self.state.compare_exchange(
            RUNNING,
            DRAINING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Escalation::Drain,
            Err(_) => {
                self.state.store(FORCED, Ordering::SeqCst);
                Escalation::Force
            }
        };
        self.notify.notify_waiters();
        escalation
    }

    /// Whether a drain (or forced exit) has been requested
    pub fn is_terminating(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING
    }

    /// Whether a forced exit has been requested
    pub fn is_forced(&self) -> bool {
        self.state.load(Ordering::SeqCst) == FORCED
    }

    /// Resolve once the flag has been raised
    pub async fn terminated(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_terminating() {
                return;
            }
            notified.await;
        }
    }
}

/// Called on the second signal; by default exits the process without cleanup
pub type ForceExitHook = Arc<dyn Fn() + Send + Sync>;

/// Default force-exit hook
pub fn exit_process() -> ForceExitHook {
    Arc::new(|| std::process::exit(0))
}

/// Apply one termination request to the flag
pub(crate) fn handle_signal(flag: &TerminateFlag, force_exit: &ForceExitHook) -> Escalation {
    let escalation = flag.escalate();
    match escalation {
        Escalation::Drain => {
            tracing::warn!("got terminate signal, draining. signal again to exit immediately.");
        }
        Escalation::Force => {
            tracing::warn!("forcing program exit");
            force_exit();
        }
    }
    escalation
}

/// Resolve on the next SIGINT or SIGTERM
async fn next_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Where termination requests come from
#[derive(Debug, Default)]
pub(crate) enum SignalSource {
    /// SIGINT and SIGTERM delivered to the process
    #[default]
    Os,
    /// One request per message; closing the channel ends the listener
    Channel(mpsc::UnboundedReceiver<()>),
}

impl SignalSource {
    /// Wait for the next request; `false` once the source is exhausted
    async fn next(&mut self) -> bool {
        match self {
            SignalSource::Os => {
                next_signal().await;
                true
            }
            SignalSource::Channel(rx) => rx.recv().await.is_some(),
        }
    }
}

/// Listen for termination requests for the length of one run.
///
/// Abort the returned task when the run ends.
pub(crate) fn spawn_signal_listener(
    flag: Arc<TerminateFlag>,
    force_exit: ForceExitHook,
    mut source: SignalSource,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while source.next().await {
            if handle_signal(&flag, &force_exit) == Escalation::Force {
                return;
            }
        }
    })
}
