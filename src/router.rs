//! Request router.
//!
//! Routes are keyed by `METHOD:path`. Registering the same key twice replaces
//! the earlier handler chain. Lookup tries the exact key first, then every
//! pattern registered for the method, in registration order.
//!
//! [`Router::handle`] drives one request through the whole pipeline:
//!
//! ```text
//! global middleware ──▶ route lookup ──▶ route handlers
//!        │                    │                 │
//!        │                  none ──▶ 404        │
//!        └──────── any Err ───┴─────────────────┴──▶ error handlers ──▶ 500
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::error::Error;
use crate::handler::{BoxedErrorHandler, ErrorHandler, Layer};
use crate::middleware::{Chain, ErrorChain};
use crate::pattern::Pattern;
use crate::request::Request;
use crate::response::Response;

/// A registered route.
#[derive(Clone)]
struct Route {
    method: String,
    path: String,
    pattern: Pattern,
    chain: Chain,
}

/// The application router.
///
/// Build it once at startup. Each builder call returns `self` so
/// registrations chain naturally.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
    index: HashMap<String, usize>,
    middleware: Chain,
    errors: ErrorChain,
    development: bool,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes error messages in the default 500 payload when `true`.
    pub fn development(mut self, enabled: bool) -> Self {
        self.development = enabled;
        self
    }

    /// Appends a global layer, run for every request before route lookup.
    pub fn use_middleware(mut self, layer: Layer) -> Self {
        self.middleware.push(layer);
        self
    }

    /// Appends an error handler.
    pub fn on_error(self, handler: impl ErrorHandler) -> Self {
        self.on_error_boxed(handler.into_boxed_error_handler())
    }

    pub(crate) fn on_error_boxed(mut self, handler: BoxedErrorHandler) -> Self {
        self.errors.push(handler);
        self
    }

    /// Registers a handler chain for a method + path pair. Returns `self` for
    /// chaining.
    ///
    /// Path variables use `:name` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust,no_run
    /// # use aero::{Error, Layer, Request, Response, Router};
    /// # async fn load_user(_: Request, _: Response) -> Result<aero::Flow, Error> { Ok(aero::Flow::Next) }
    /// # async fn get_user(_: Request, _: Response) -> Result<(), Error> { Ok(()) }
    /// Router::new()
    ///     .route("GET", "/users/:id", [Layer::middleware(load_user), Layer::endpoint(get_user)]);
    /// ```
    pub fn route(mut self, method: &str, path: &str, handlers: impl IntoIterator<Item = Layer>) -> Self {
        let method = method.to_ascii_uppercase();
        let key = format!("{method}:{path}");
        let route = Arc::new(Route {
            pattern: Pattern::parse(path),
            chain: Chain::from(handlers.into_iter().collect::<Vec<_>>()),
            method,
            path: path.to_owned(),
        });

        match self.index.get(&key) {
            Some(&slot) => self.routes[slot] = route,
            None => {
                self.index.insert(key, self.routes.len());
                self.routes.push(route);
            }
        }
        self
    }

    /// Registered route keys, in registration order.
    pub fn routes(&self) -> impl Iterator<Item = String> + '_ {
        self.routes.iter().map(|r| format!("{}:{}", r.method, r.path))
    }

    fn lookup(&self, method: &str, path: &str) -> Option<(Arc<Route>, HashMap<String, String>)> {
        if let Some(&slot) = self.index.get(&format!("{method}:{path}")) {
            let route = &self.routes[slot];
            if let Some(params) = route.pattern.matches(path) {
                return Some((Arc::clone(route), params));
            }
        }
        self.routes.iter()
            .filter(|r| r.method == method)
            .find_map(|r| r.pattern.matches(path).map(|params| (Arc::clone(r), params)))
    }

    /// Runs the full pipeline for one request.
    ///
    /// Never fails: errors end up in the error-handler chain, and an
    /// unmatched route is answered with 404.
    pub async fn handle(&self, req: Request, res: Response) {
        if let Err(err) = self.dispatch(&req, &res).await {
            self.errors.handle(err, &req, &res, self.development).await;
        }
    }

    async fn dispatch(&self, req: &Request, res: &Response) -> Result<(), Error> {
        self.middleware.execute(req, res, || async {
            match self.lookup(req.method().as_str(), req.path()) {
                Some((route, params)) => {
                    req.set_params(params);
                    route.chain.execute(req, res, || async { Ok::<(), Error>(()) }).await
                }
                None => {
                    res.status(404).json(&json!({ "error": "Not Found" }))?;
                    Ok(())
                }
            }
        }).await
    }
}
