//! SIGTERM / SIGINT handling for the command-line entry point.
//!
//! Restores have no cooperative cancellation: in-flight downloads are simply
//! dropped when the process exits. Partial `.part` files may remain and are
//! replaced on the next run.

use tokio::signal;
use tracing::info;

/// Resolve once SIGINT or SIGTERM is received, returning the signal name.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let name = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            "SIGINT"
        }
        _ = terminate => "SIGTERM",
    };

    info!("Received {}, stopping restore", name);
    Ok(name)
}
