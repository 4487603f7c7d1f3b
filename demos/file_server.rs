//! Serves the current directory under `/files`.
use kiln_web::{Handlers, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), kiln_web::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let root = std::env::args().nth(1).unwrap_or_else(|| ".".to_string());

    let handlers = Handlers::new();
    handlers.add_directory_handler("/files", root, Some("index.html"), 60);

    Server::builder()
        .handlers(handlers)
        .name("file_server")
        .bind("127.0.0.1:8080".parse().unwrap())
        .await?
        .launch()
        .await;
    Ok(())
}
