use tokio::signal;
use tracing::{error, info};

/// Resolve on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use signal::unix::{SignalKind, signal};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "cannot install signal handlers, falling back to ctrl-c");
                    let _ = signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv()  => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shutdown_signal_with_timeout() {
        let result = timeout(Duration::from_millis(100), shutdown_signal()).await;
        assert!(result.is_err(), "Should timeout waiting for signal");
    }
}
