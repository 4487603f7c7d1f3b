use kiln_web::{BodyKind, Handlers, Method, Processor, Response, Server};
use std::{thread, time::Duration};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), kiln_web::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let handlers = Handlers::new();

    // Answered from a plain thread
    handlers.add_path_handler(
        Method::Get,
        "/slow",
        BodyKind::Data,
        Processor::deferred(|req, responder| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(500));
                responder.respond(Response::text(format!("slow answer for {}", req.peer_addr())));
            });
        }),
    );

    // Answered from a task
    handlers.add_regex_handler(
        Method::Get,
        r"^/wait/\d+$",
        BodyKind::Data,
        Processor::async_fn(|req| async move {
            let ms: u64 = req.url().path_segments().last().unwrap_or_default().parse()?;
            tokio::time::sleep(Duration::from_millis(ms.min(5000))).await;
            Ok(Response::text(format!("waited {ms} ms")))
        }),
    )?;

    Server::builder()
        .handlers(handlers)
        .bind("127.0.0.1:8080".parse().unwrap())
        .await?
        .launch()
        .await;
    Ok(())
}
