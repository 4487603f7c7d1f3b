use kiln_web::{BodyKind, Handlers, Method, Processor, Response, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), kiln_web::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let handlers = Handlers::new();
    handlers.add_default_handler(
        Method::Get,
        BodyKind::Data,
        Processor::sync(|_| Ok(Response::text("Hello, world!"))),
    );

    Server::builder()
        .handlers(handlers)
        .bind("127.0.0.1:8080".parse().unwrap())
        .await?
        .launch()
        .await;
    Ok(())
}
