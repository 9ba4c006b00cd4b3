//! Server startup and graceful shutdown

use std::future::Future;

use anyhow::Result;
use axum::Router;
use mediopt_core::Config;

/// Start the server with graceful shutdown
pub async fn start_server(config: &Config, app: Router) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.server_port());
    tracing::info!(addr = %addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let image = config.image_profile();
    let video = config.video_profile();
    tracing::info!(
        image_max_dimension = image.max_dimension,
        image_quality = image.quality,
        max_image_mb = image.max_input_bytes / 1024 / 1024,
        video_max_width = video.max_width,
        video_crf = video.crf,
        video_preset = %video.preset,
        ffmpeg_path = %config.ffmpeg_path(),
        spool_video_input = config.video_spool_input(),
        upload_timeout_secs = config.upload_timeout().as_secs(),
        "Server ready and accepting connections"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, then flushes telemetry.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        let mut signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        signal.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    let signal = wait_for_signal(tokio::signal::ctrl_c(), terminate).await;
    tracing::info!(signal, "Shutting down gracefully...");

    crate::telemetry::shutdown_telemetry().await;
}

/// Waits for the first signal source to fire. A source whose handler cannot be
/// installed is logged and ignored so the other one still triggers shutdown.
async fn wait_for_signal<C, T>(ctrl_c: C, terminate: T) -> &'static str
where
    C: Future<Output = std::io::Result<()>>,
    T: Future<Output = std::io::Result<()>>,
{
    let ctrl_c = async {
        if let Err(e) = ctrl_c.await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        if let Err(e) = terminate.await {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => "ctrl_c",
        _ = terminate => "terminate",
    }
}
