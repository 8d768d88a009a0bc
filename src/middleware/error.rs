//! The error-handler chain.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, warn};

use crate::error::Error;
use crate::handler::BoxedErrorHandler;
use crate::request::Request;
use crate::response::Response;

/// Error handlers, tried in registration order until one succeeds.
#[derive(Clone, Default)]
pub(crate) struct ErrorChain {
    handlers: Vec<BoxedErrorHandler>,
}

impl ErrorChain {
    pub(crate) fn push(&mut self, handler: BoxedErrorHandler) {
        self.handlers.push(handler);
    }

    /// Hands `err` to each handler until one returns `Ok`. A handler that
    /// fails is skipped; its own error is logged and dropped. When every
    /// handler failed (or none is registered) the reply is a 500.
    pub(crate) async fn handle(&self, err: Error, req: &Request, res: &Response, development: bool) {
        let err = Arc::new(err);

        for (index, handler) in self.handlers.iter().enumerate() {
            match handler.call(Arc::clone(&err), req.clone(), res.clone()).await {
                Ok(()) => return,
                Err(e) => warn!(index, error = %e, "error handler failed, trying the next one"),
            }
        }

        error!(error = %err, method = %req.method(), path = req.path(), "unhandled error");

        let payload = if development {
            json!({ "error": "Internal Server Error", "message": err.to_string() })
        } else {
            json!({ "error": "Internal Server Error" })
        };
        if let Err(e) = res.status(500).json(&payload) {
            error!(error = %e, "failed to write the default error response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::Value;

    use crate::handler::ErrorHandler;
    use crate::request::tests::request;
    use crate::response::tests::read_json;

    type Log = Arc<Mutex<Vec<String>>>;

    fn handler(log: &Log, name: &'static str, succeed: bool) -> BoxedErrorHandler {
        let log = Arc::clone(log);
        let f = move |err: Arc<Error>, _req: Request, res: Response| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}: {err}"));
                if succeed {
                    res.status(400).json(&json!({ "handled_by": name }))?;
                    Ok::<(), Error>(())
                } else {
                    Err(Error::msg("handler broke"))
                }
            }
        };
        f.into_boxed_error_handler()
    }

    #[tokio::test]
    async fn failing_handler_passes_to_the_next() {
        let log = Log::default();
        let mut chain = ErrorChain::default();
        chain.push(handler(&log, "first", false));
        chain.push(handler(&log, "second", true));
        chain.push(handler(&log, "third", true));

        let (res, rx) = Response::channel();
        chain.handle(Error::msg("boom"), &request("GET", "/", &[]), &res, false).await;

        assert_eq!(*log.lock().unwrap(), ["first: boom", "second: boom"]);
        let (status, body) = read_json(rx).await;
        assert_eq!(status, 400);
        assert_eq!(body, json!({ "handled_by": "second" }));
    }

    #[tokio::test]
    async fn exhausted_chain_answers_500() {
        let log = Log::default();
        let mut chain = ErrorChain::default();
        chain.push(handler(&log, "only", false));

        let (res, rx) = Response::channel();
        chain.handle(Error::msg("boom"), &request("GET", "/", &[]), &res, false).await;

        let (status, body) = read_json(rx).await;
        assert_eq!(status, 500);
        assert_eq!(body, json!({ "error": "Internal Server Error" }));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn development_mode_exposes_the_message() {
        let (res, rx) = Response::channel();
        ErrorChain::default()
            .handle(Error::msg("db is down"), &request("GET", "/", &[]), &res, true)
            .await;

        let (status, body) = read_json(rx).await;
        assert_eq!(status, 500);
        assert_eq!(body["message"], Value::from("db is down"));
    }
}
