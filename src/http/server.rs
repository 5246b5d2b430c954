use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use super::routes::create_router;
use super::state::AppState;
use crate::session::SessionOrchestrator;

/// Serve the control API until `signal` fires.
///
/// Sessions are stopped as part of the graceful shutdown, before open live
/// streams are waited on; their bodies only end once the broadcasts close.
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<SessionOrchestrator>,
    signal: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let app = create_router(AppState::new(Arc::clone(&orchestrator)));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutdown requested");
            orchestrator.shutdown().await;
        })
        .await
}
