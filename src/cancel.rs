use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{error, warn};

use crate::error::HarvestError;

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cooperative stop signal checked by workers between tasks.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancels `token` on the first Ctrl-C and exits the process on the second.
pub fn install_interrupt_handler(token: CancellationToken) -> Result<(), HarvestError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .map_err(|err| HarvestError::Configuration(format!("signal runtime: {err}")))?;
    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!(error = %err, "failed to listen for Ctrl-C");
                    return;
                }
                warn!("interrupt received, finishing in-flight downloads (Ctrl-C again to abort)");
                token.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("second interrupt, exiting immediately");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            });
        })
        .map_err(|err| HarvestError::Configuration(err.to_string()))?;
    Ok(())
}
