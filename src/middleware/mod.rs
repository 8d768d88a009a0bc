//! Middleware chains.
//!
//! A [`Chain`] runs its layers strictly in registration order. Instead of
//! handing every layer a `next` closure, the chain is a plain loop with a
//! cursor: a layer returns [`Flow::Next`] to advance it, [`Flow::Stop`] to
//! end the chain early, or an error to abort the whole call. Long chains do
//! not grow the stack.
//!
//! ```text
//! layer 0 ── Next ──▶ layer 1 ── Next ──▶ … ──▶ final step
//!    │                   │
//!  Stop / Err          Stop / Err  ──▶ return (final step skipped)
//! ```
//!
//! Failures are not handled here. They propagate to the caller, which hands
//! them to the [`ErrorChain`].

mod error;

pub(crate) use error::ErrorChain;

use std::future::Future;

use crate::error::Error;
use crate::handler::{Flow, Layer};
use crate::request::Request;
use crate::response::Response;

#[derive(Clone, Default)]
pub(crate) struct Chain {
    layers: Vec<Layer>,
}

impl Chain {
    pub(crate) fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Runs every layer, then `final_step` if no layer stopped the chain.
    ///
    /// The first failing layer ends the call with its error; no later layer
    /// and no final step runs.
    pub(crate) async fn execute<F, Fut>(
        &self,
        req: &Request,
        res: &Response,
        final_step: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        for layer in &self.layers {
            if layer.call(req.clone(), res.clone()).await? == Flow::Stop {
                return Ok(());
            }
        }
        final_step().await
    }
}

impl From<Vec<Layer>> for Chain {
    fn from(layers: Vec<Layer>) -> Self {
        Self { layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::request::tests::request;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn step(log: &Log, name: &'static str, flow: Flow) -> Layer {
        let log = Arc::clone(log);
        Layer::middleware(move |_req: Request, _res: Response| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Ok::<_, Error>(flow)
            }
        })
    }

    fn failing(log: &Log, name: &'static str) -> Layer {
        let log = Arc::clone(log);
        Layer::endpoint(move |_req: Request, _res: Response| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                Err::<(), _>(Error::msg(format!("{name} failed")))
            }
        })
    }

    async fn run(chain: &Chain, log: &Log) -> Result<(), Error> {
        let (res, _rx) = Response::channel();
        let log = Arc::clone(log);
        chain.execute(&request("GET", "/", &[]), &res, || async move {
            log.lock().unwrap().push("final");
            Ok::<(), Error>(())
        }).await
    }

    #[tokio::test]
    async fn layers_run_in_registration_order() {
        let log = Log::default();
        let mut chain = Chain::default();
        for name in ["A", "B", "C"] {
            chain.push(step(&log, name, Flow::Next));
        }

        run(&chain, &log).await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["A", "B", "C", "final"]);
    }

    #[tokio::test]
    async fn empty_chain_goes_straight_to_final_step() {
        let log = Log::default();
        run(&Chain::default(), &log).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["final"]);
    }

    #[tokio::test]
    async fn stop_skips_the_rest() {
        let log = Log::default();
        let chain = Chain::from(vec![
            step(&log, "A", Flow::Stop),
            step(&log, "B", Flow::Next),
        ]);

        run(&chain, &log).await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["A"]);
    }

    #[tokio::test]
    async fn failure_aborts_the_chain() {
        let log = Log::default();
        let chain = Chain::from(vec![
            step(&log, "A", Flow::Next),
            failing(&log, "B"),
            step(&log, "C", Flow::Next),
        ]);

        let err = run(&chain, &log).await.unwrap_err();

        assert_eq!(err.to_string(), "B failed");
        assert_eq!(*log.lock().unwrap(), ["A", "B"]);
    }
}
