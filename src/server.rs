//! TCP bootstrap for the handler side.
//!
//! Binds a listener, spawns one handler task per accepted connection,
//! and drains them on Ctrl-C/SIGTERM through a watch channel. The
//! session logic itself lives in [`crate::handler`]; this module only
//! owns the accept loop.

use std::sync::Arc;

use anyhow::Result;
use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinSet,
};
use tracing::{error, info, warn};

use crate::{handler, registry::CommandRegistry, session::SessionConfig};

/// Bind `bind` and serve until a termination signal arrives.
///
/// # Errors
/// Propagates bind failures; per-connection errors are logged and do not
/// stop the listener.
pub async fn run(bind: &str, registry: Arc<CommandRegistry>, cfg: SessionConfig) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, identity = registry.identity(), "formwire listening");
    accept_connections(listener, registry, cfg, shutdown_signal()).await
}

/// Accept connections until `shutdown` resolves, then drain the spawned
/// handler tasks.
///
/// # Errors
/// Currently only I/O failures surfaced while accepting are logged, so
/// this returns `Ok` unless task joining fails fatally.
pub async fn accept_connections(
    listener: TcpListener,
    registry: Arc<CommandRegistry>,
    cfg: SessionConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut join_set = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let registry = Arc::clone(&registry);
                        let cfg = cfg.clone();
                        let mut rx = shutdown_rx.clone();
                        join_set.spawn(async move {
                            if let Err(e) =
                                handler::serve_session(socket, registry, cfg, &mut rx).await
                            {
                                warn!(%peer, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
        }
    }

    // notify all sessions to shut down
    let _ = shutdown_tx.send(true);

    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "session task panicked");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    outcome = tokio::signal::ctrl_c() => {
                        if let Err(err) = outcome {
                            error!(error = %err, "failed to listen for Ctrl-C");
                        }
                    }
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl-C");
    }
}
