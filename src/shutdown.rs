use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The polling loop, watchdog and status server all stop on it.
/// An in-flight task is not interrupted; its node result stays in progress
/// until the watchdog times it out.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping agent");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping agent");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
