use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self as nix_signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Turns SIGINT/SIGTERM into cancellation of in-flight lifecycle waits.
///
/// The first signal cancels the token so the running operation can return
/// `Cancelled`. A second signal exits immediately.
#[derive(Debug)]
pub struct Shutdown {
    token: CancellationToken,
    last_signal: AtomicI32,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            last_signal: AtomicI32::new(0),
        })
    }

    pub fn install_signals(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => Signal::SIGINT,
                    _ = sigterm.recv() => Signal::SIGTERM,
                };

                if shutdown.last_signal().is_some() {
                    info!("Received second signal, forcing exit...");
                    shutdown.exit_process();
                }

                info!("Received {:?}, interrupting...", received);
                shutdown
                    .last_signal
                    .store(received as i32, Ordering::Relaxed);
                shutdown.token.cancel();
            }
        });
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            i => Signal::try_from(i).ok(),
        }
    }

    /// Restore the default handler for the last received signal and re-raise
    /// it, so the exit status reflects the signal.
    pub fn exit_process(&self) -> ! {
        let signal = self.last_signal().unwrap_or(Signal::SIGTERM);
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: installing SIG_DFL does not run any handler code.
        if let Err(e) = unsafe { nix_signal::sigaction(signal, &action) } {
            warn!("Failed to restore default handler for {:?}: {}", signal, e);
        } else if let Err(e) = nix_signal::kill(unistd::getpid(), signal) {
            warn!("Failed to re-raise {:?}: {}", signal, e);
        }
        std::process::exit(128 + signal as i32);
    }
}
