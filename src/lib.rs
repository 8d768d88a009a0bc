//! # aero
//!
//! A minimal HTTP server toolkit: stateful request/response wrappers, ordered
//! middleware chains and a method + path router.
//!
//! ## The request lifecycle
//!
//! 1. The server accepts a connection and wraps each request in a
//!    [`Request`] / [`Response`] pair. The body keeps streaming into the
//!    `Request` while handlers run.
//! 2. Global middleware runs in registration order. Any layer can stop the
//!    chain ([`Flow::Stop`]) or fail it (`Err`).
//! 3. The router resolves `METHOD:path`, binds `:name` variables and runs the
//!    route's own handler chain. No match means `404 {"error":"Not Found"}`.
//! 4. Any failure goes to the error handlers, in order, until one succeeds.
//!    If none does: `500 {"error":"Internal Server Error"}`.
//!
//! A response flushes exactly once. Every later `send`, `end`, `json` or
//! `redirect` is silently ignored.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use aero::{Error, Flow, Layer, Request, Response, Server, ServerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let server = Server::new(ServerConfig::default().with_env());
//!
//!     server
//!         .use_middleware(Layer::middleware(require_json))
//!         .add_route("GET",  "/users/:id", [Layer::endpoint(get_user)])
//!         .add_route("POST", "/users",     [Layer::endpoint(create_user)]);
//!
//!     server.run().await
//! }
//!
//! async fn require_json(req: Request, res: Response) -> Result<Flow, Error> {
//!     if req.method() == "POST" && !req.accepts("application/json") {
//!         res.status(406).json(&json!({ "error": "Not Acceptable" }))?;
//!         return Ok(Flow::Stop);
//!     }
//!     Ok(Flow::Next)
//! }
//!
//! async fn get_user(req: Request, res: Response) -> Result<(), Error> {
//!     res.json(&json!({ "id": req.param("id") }))
//! }
//!
//! async fn create_user(req: Request, res: Response) -> Result<(), Error> {
//!     let body = req.received().await.ok_or_else(|| Error::msg("missing body"))?;
//!     res.status(201).set_header("Location", "/users/99").json(&body)
//! }
//! ```

mod config;
mod error;
mod events;
mod handler;
mod middleware;
mod pattern;
mod request;
mod response;
mod router;
mod server;

pub use config::ServerConfig;
pub use error::{BodyError, BoxError, Error};
pub use events::Subscription;
pub use handler::{Endpoint, ErrorHandler, Flow, Layer, Middleware};
pub use request::{Protocol, Request, RequestEvent, RequestEventKind};
pub use response::{Response, ResponseEvent, ResponseEventKind};
pub use router::Router;
pub use server::{Server, ServerEvent, ServerEventKind};
