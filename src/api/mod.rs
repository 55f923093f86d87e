//! Action surface: one axum route per logical coordinator action

pub mod envelope;
pub mod handlers;
pub mod routes;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::engine::Coordinator;
use crate::error::Result;

pub use envelope::Envelope;
pub use handlers::AppState;
pub use routes::create_router;

/// Start the action API server
pub async fn start_api_server(coordinator: Coordinator, port: u16) -> Result<()> {
    let app = create_router(AppState { coordinator });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("API server listening on http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
