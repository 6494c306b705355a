use annoflow_infra::CoordinatorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    annoflow_observability::init();

    let config = CoordinatorConfig::from_env()?;
    let bind = config.http.bind;

    let backend = annoflow_api::app::build_backend(config).await?;
    let coordinator = backend.start()?;
    let app = annoflow_api::app::build_app(backend.services());

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    tokio::task::spawn_blocking(move || coordinator.shutdown()).await?;
    tracing::info!("stopped");
    Ok(())
}
