//! `curl -F note=hi -F file=@Cargo.toml localhost:8080/upload`
//! `curl -d 'a=1&b=hello+world' localhost:8080/form`
use kiln_web::{form, BodyKind, Handlers, Method, Processor, Response, Server};
use std::fs;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), kiln_web::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let handlers = Handlers::new();

    handlers.add_path_handler(
        Method::Post,
        "/form",
        BodyKind::UrlEncodedForm,
        Processor::sync(|req| {
            let mut pairs: Vec<_> = req.arguments().into_iter().flatten().collect();
            pairs.sort();
            Ok(Response::text(form::encode(pairs)))
        }),
    );

    handlers.add_path_handler(
        Method::Post,
        "/upload",
        BodyKind::MultipartForm,
        Processor::sync(|req| {
            let mut out = String::new();

            for (name, argument) in req.multipart_arguments().into_iter().flatten() {
                let value = argument.string().unwrap_or("<binary>");
                out.push_str(&format!("{name} = {value}\n"));
            }
            for (name, file) in req.files().into_iter().flatten() {
                let size = fs::metadata(file.temporary_path())?.len();
                out.push_str(&format!(
                    "{name}: {} ({}, {size} bytes)\n",
                    file.file_name(),
                    file.mime_type()
                ));
            }

            Ok(Response::text(out))
        }),
    );

    handlers.add_default_handler(
        Method::Put,
        BodyKind::File,
        Processor::sync(|req| {
            let size = match req.file_path() {
                Some(path) => fs::metadata(path)?.len(),
                None => 0,
            };
            Ok(Response::text(format!("stored {size} bytes for {}", req.path())))
        }),
    );

    Server::builder()
        .handlers(handlers)
        .bind("127.0.0.1:8080".parse().unwrap())
        .await?
        .launch()
        .await;
    Ok(())
}
