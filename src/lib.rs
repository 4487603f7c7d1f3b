//! kiln_web - Embeddable HTTP/1.x server with streaming bodies
//!
//! A small HTTP/1.0 and HTTP/1.1 server meant to live inside an application.
//! Requests are routed through a first-match handler chain; each handler
//! decides up front how the request body is stored (memory, temporary file,
//! URL-encoded form, multipart form) and the body is streamed straight into
//! that storage.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked request and
//!   response bodies, `Expect: 100-continue`
//! - **HTTP/1.0**: close-delimited bodies, `Connection: keep-alive` on request
//!
//! # Request flow
//!
//! ```text
//! accept -> request line -> headers -> match handler -> body -> processor -> response
//!                                           |
//!                                           \-> no match: body discarded, 404
//! ```
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use kiln_web::{BodyKind, Handlers, Method, Processor, Response, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kiln_web::Error> {
//!     let handlers = Handlers::new();
//!     handlers.add_path_handler(
//!         Method::Get,
//!         "/",
//!         BodyKind::Data,
//!         Processor::sync(|_| Ok(Response::text("Hello World!"))),
//!     );
//!
//!     Server::builder()
//!         .handlers(handlers)
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .await?
//!         .launch()
//!         .await;
//!     Ok(())
//! }
//! ```
//! Uploads and forms:
//! ```no_run
//! use kiln_web::{BodyKind, Handlers, Method, Processor, Response, StatusCode};
//!
//! let handlers = Handlers::new();
//!
//! handlers.add_path_handler(
//!     Method::Post,
//!     "/login",
//!     BodyKind::UrlEncodedForm,
//!     Processor::sync(|req| {
//!         let user = req.arguments().and_then(|args| args.get("user"));
//!         Ok(match user {
//!             Some(user) => Response::redirect(format!("/home?user={user}"), false),
//!             None => Response::status_only(StatusCode::BadRequest),
//!         })
//!     }),
//! );
//!
//! handlers.add_path_handler(
//!     Method::Post,
//!     "/upload",
//!     BodyKind::MultipartForm,
//!     Processor::sync(|req| {
//!         let names: Vec<_> = req
//!             .files()
//!             .into_iter()
//!             .flatten()
//!             .map(|(field, file)| format!("{field}: {}", file.file_name()))
//!             .collect();
//!         Ok(Response::text(names.join("\n")))
//!     }),
//! );
//!
//! handlers.add_directory_handler("/static", "./public", Some("index.html"), 3600);
//! ```
//!
//! # Logging
//!
//! Events are emitted through [`tracing`]; install a subscriber in the
//! application to see them.

pub(crate) mod http {
    pub(crate) mod chunked;
    pub mod form;
    pub mod multipart;
    pub(crate) mod parser;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod handlers;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, ProcessError},
    http::{
        form, multipart,
        request::{BodyKind, BodySink, Request, RequestHead},
        response::{BodySource, Response},
        types::{HeaderMap, Method, StatusCode, Url, Version},
    },
    server::{
        handlers::{Handler, Handlers, Matcher, Processor, Responder},
        server_impl::{Discovery, Server, ServerBuilder, ServerHandle},
    },
};

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }
}
