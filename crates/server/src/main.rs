use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    let config = seg_server::load_config();
    config.log_summary();

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{host}:{port}");

    let app = seg_server::startup::build(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
