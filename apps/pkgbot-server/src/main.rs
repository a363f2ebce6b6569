use std::time::Duration;

use pkgbot_core::transport::SessionState;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

mod bootstrap;
mod bridge;
mod webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Signal,
    LoggedOut,
}

#[tokio::main]
async fn main() {
    pkgbot_otel::init();

    let bootstrap::BootstrapOutput {
        router,
        listen,
        session,
        supervisor,
        background_tasks,
    } = match bootstrap::build().await {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: failed to bind {listen}: {err}");
            std::process::exit(2);
        }
    };
    info!(target: "pkgbot::bootstrap", %listen, "webhook listening");

    let (reason_tx, reason_rx) = oneshot::channel();
    let session_rx = session.subscribe();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let reason = shutdown_signal(session_rx).await;
        let _ = reason_tx.send(reason);
    });
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }
    let reason = reason_rx.await.unwrap_or(ShutdownReason::Signal);

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(1))
        .await;
    supervisor.shutdown().await;

    if reason == ShutdownReason::LoggedOut {
        error!(target: "pkgbot::session", "chat session logged out; re-link the account and restart");
        std::process::exit(1);
    }
}

async fn shutdown_signal(mut session: watch::Receiver<SessionState>) -> ShutdownReason {
    let logged_out = async move {
        let sender_gone = session.wait_for(SessionState::is_terminal).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                }
                Err(err) => {
                    error!("failed to install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate => {},
            _ = logged_out => return ShutdownReason::LoggedOut,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = logged_out => return ShutdownReason::LoggedOut,
        }
    }

    info!("shutdown signal received");
    ShutdownReason::Signal
}
