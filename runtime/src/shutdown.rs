use tokio::sync::watch;

/// Cooperative cancellation signal shared by every task a worker spawns
/// (spec §5: "workers drain in-flight batches and persist active sessions
/// before exiting on SIGTERM/SIGINT"). Cloning is cheap; every consumer/
/// control loop holds its own receiver and checks it alongside `recv()`.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Resolves once SIGINT or SIGTERM arrives, then flips the shared flag.
    /// Safe to await from multiple tasks; only the first caller observes the
    /// signal itself, every caller observes the flag flip.
    pub async fn listen(&self) {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
