//! Minimal aero example: JSON endpoints, a request logger and an error handler.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/x-www-form-urlencoded' \
//!        -d 'name=bob'
//!   curl -i http://localhost:3000/old-users/42
//!   curl -i http://localhost:3000/boom

use std::sync::Arc;
use std::time::Instant;

use aero::{Error, Flow, Layer, Request, Response, ResponseEventKind, Server, ServerConfig, ServerEventKind};
use serde_json::json;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let server = Server::new(ServerConfig::default().with_env());

    server.on(ServerEventKind::Error, |ev| error!(?ev, "transport error"));

    server
        .use_middleware(Layer::middleware(log_requests))
        .on_error(|err: Arc<Error>, _req: Request, res: Response| async move {
            res.status(500).json(&json!({ "error": "something broke", "detail": err.to_string() }))
        })
        .add_route("GET",    "/users/:id",     [Layer::endpoint(get_user)])
        .add_route("POST",   "/users",         [Layer::endpoint(create_user)])
        .add_route("DELETE", "/users/:id",     [Layer::middleware(require_token), Layer::endpoint(delete_user)])
        .add_route("GET",    "/old-users/:id", [Layer::endpoint(moved)])
        .add_route("GET",    "/boom",          [Layer::endpoint(boom)]);

    server.run().await
}

// Logs one line per request once the response is flushed.
async fn log_requests(req: Request, res: Response) -> Result<Flow, Error> {
    let started = Instant::now();
    let line = format!("{} {}", req.method(), req.url());
    res.once(ResponseEventKind::Send, move |_| info!(elapsed = ?started.elapsed(), "{line}"));
    Ok(Flow::Next)
}

// GET /users/:id
async fn get_user(req: Request, res: Response) -> Result<(), Error> {
    res.json(&json!({ "id": req.param("id"), "name": "alice" }))
}

// POST /users, JSON or form body.
async fn create_user(req: Request, res: Response) -> Result<(), Error> {
    let Some(body) = req.received().await else {
        return res.status(400).json(&json!({ "error": "expected a JSON or form body" }));
    };
    res.status(201)
        .set_header("Location", "/users/99")
        .json(&json!({ "id": "99", "name": body["name"] }))
}

async fn require_token(req: Request, res: Response) -> Result<Flow, Error> {
    if req.has_header("authorization") {
        return Ok(Flow::Next);
    }
    res.status(401).json(&json!({ "error": "Unauthorized" }))?;
    Ok(Flow::Stop)
}

// DELETE /users/:id → 204 No Content
async fn delete_user(_req: Request, res: Response) -> Result<(), Error> {
    res.status(204).send(Vec::new());
    Ok(())
}

async fn moved(req: Request, res: Response) -> Result<(), Error> {
    let id = req.param("id").unwrap_or_default();
    res.redirect_with(&format!("/users/{id}"), 301);
    Ok(())
}

async fn boom(_req: Request, _res: Response) -> Result<(), Error> {
    Err(Error::msg("this route always fails"))
}
