//! Handler shapes and type erasure.
//!
//! # The three shapes
//!
//! | Shape | Signature | Registered as |
//! |---|---|---|
//! | middleware | `async fn(Request, Response) -> Result<Flow, Error>` | [`Layer::middleware`] |
//! | endpoint | `async fn(Request, Response) -> Result<(), Error>` | [`Layer::endpoint`] |
//! | error handler | `async fn(Arc<Error>, Request, Response) -> Result<(), Error>` | `on_error` |
//!
//! The shape is chosen by the call that registers the function, never guessed
//! from its arguments. Middleware and endpoints share one chain, so they are
//! the two cases of the [`Layer`] enum.
//!
//! # How async handlers are stored
//!
//! ```text
//! async fn auth(req, res) -> Result<Flow, Error> { … }   ← user writes this
//!        ↓ Layer::middleware(auth)
//! Arc::new(FnMiddleware(auth))                          ← heap-allocated wrapper
//!        ↓  stored as BoxedMiddleware = Arc<dyn ErasedMiddleware>
//! layer.call(req, res)  at request time                 ← one vtable dispatch
//!        ↓
//! Box::pin(auth(req, res))                              ← BoxFuture
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// What a middleware wants to happen after it returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Run the next handler in the chain.
    Next,
    /// Stop here. Nothing later in this chain runs.
    Stop,
}

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future.
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[doc(hidden)]
pub trait ErasedMiddleware {
    fn call(&self, req: Request, res: Response) -> BoxFuture<Result<Flow, Error>>;
}

#[doc(hidden)]
pub trait ErasedEndpoint {
    fn call(&self, req: Request, res: Response) -> BoxFuture<Result<(), Error>>;
}

#[doc(hidden)]
pub trait ErasedErrorHandler {
    fn call(&self, err: Arc<Error>, req: Request, res: Response) -> BoxFuture<Result<(), Error>>;
}

#[doc(hidden)]
pub type BoxedMiddleware = Arc<dyn ErasedMiddleware + Send + Sync + 'static>;
#[doc(hidden)]
pub type BoxedEndpoint = Arc<dyn ErasedEndpoint + Send + Sync + 'static>;
#[doc(hidden)]
pub type BoxedErrorHandler = Arc<dyn ErasedErrorHandler + Send + Sync + 'static>;

// ── Layer ─────────────────────────────────────────────────────────────────────

/// One step of a handler chain.
#[derive(Clone)]
pub enum Layer {
    Middleware(BoxedMiddleware),
    Endpoint(BoxedEndpoint),
}

impl Layer {
    /// A step that decides whether the chain goes on.
    pub fn middleware(f: impl Middleware) -> Self {
        Self::Middleware(f.into_boxed_middleware())
    }

    /// A step that does its work and always lets the chain go on.
    pub fn endpoint(f: impl Endpoint) -> Self {
        Self::Endpoint(f.into_boxed_endpoint())
    }

    pub(crate) async fn call(&self, req: Request, res: Response) -> Result<Flow, Error> {
        match self {
            Self::Middleware(m) => m.call(req, res).await,
            Self::Endpoint(e) => e.call(req, res).await.map(|()| Flow::Next),
        }
    }
}

// ── Public traits ─────────────────────────────────────────────────────────────

/// Implemented for every async function usable as a middleware.
///
/// Sealed; satisfied by any `Fn(Request, Response) -> impl Future<Output =
/// Result<Flow, Error>>`.
pub trait Middleware: private::SealedMiddleware + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_middleware(self) -> BoxedMiddleware;
}

/// Implemented for every async function usable as an endpoint.
pub trait Endpoint: private::SealedEndpoint + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_endpoint(self) -> BoxedEndpoint;
}

/// Implemented for every async function usable as an error handler.
///
/// Returning `Ok(())` means the error is handled. Returning `Err` hands the
/// original error to the next registered error handler.
pub trait ErrorHandler: private::SealedErrorHandler + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_error_handler(self) -> BoxedErrorHandler;
}

mod private {
    pub trait SealedMiddleware {}
    pub trait SealedEndpoint {}
    pub trait SealedErrorHandler {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut> private::SealedMiddleware for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, Error>> + Send + 'static,
{
}

impl<F, Fut> Middleware for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Flow, Error>> + Send + 'static,
{
    fn into_boxed_middleware(self) -> BoxedMiddleware {
        Arc::new(FnMiddleware(self))
    }
}

impl<F, Fut> private::SealedEndpoint for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
}

impl<F, Fut> Endpoint for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn into_boxed_endpoint(self) -> BoxedEndpoint {
        Arc::new(FnEndpoint(self))
    }
}

impl<F, Fut> private::SealedErrorHandler for F
where
    F: Fn(Arc<Error>, Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
}

impl<F, Fut> ErrorHandler for F
where
    F: Fn(Arc<Error>, Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn into_boxed_error_handler(self) -> BoxedErrorHandler {
        Arc::new(FnErrorHandler(self))
    }
}

// ── Concrete wrappers ─────────────────────────────────────────────────────────

struct FnMiddleware<F>(F);
struct FnEndpoint<F>(F);
struct FnErrorHandler<F>(F);

impl<F, Fut> ErasedMiddleware for FnMiddleware<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Flow, Error>> + Send + 'static,
{
    fn call(&self, req: Request, res: Response) -> BoxFuture<Result<Flow, Error>> {
        Box::pin((self.0)(req, res))
    }
}

impl<F, Fut> ErasedEndpoint for FnEndpoint<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, req: Request, res: Response) -> BoxFuture<Result<(), Error>> {
        Box::pin((self.0)(req, res))
    }
}

impl<F, Fut> ErasedErrorHandler for FnErrorHandler<F>
where
    F: Fn(Arc<Error>, Request, Response) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, err: Arc<Error>, req: Request, res: Response) -> BoxFuture<Result<(), Error>> {
        Box::pin((self.0)(err, req, res))
    }
}
