//! Process signals to cancellation
//!
//! The first SIGINT, SIGTERM or SIGQUIT cancels the returned token so the
//! host can drain. A second one exits the process immediately with status 1.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
            _ = self.quit.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Token cancelled on the first shutdown signal
///
/// Handlers are installed before this returns, so a failure to install them
/// is reported here rather than silently ignored.
pub fn shutdown_token() -> std::io::Result<CancellationToken> {
    let mut signals = ShutdownSignals::register()?;
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        signals.recv().await;
        info!("received shutdown signal, draining");
        cancel.cancel();

        signals.recv().await;
        warn!("received second shutdown signal, exiting immediately");
        std::process::exit(1);
    });

    Ok(token)
}
