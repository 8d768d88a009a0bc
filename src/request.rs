//! Incoming HTTP request type.
//!
//! A [`Request`] is created as soon as the head of a request is accepted. The
//! body keeps arriving afterwards: each chunk is appended to the raw buffer
//! and announced as [`RequestEvent::Data`]. When the stream ends the body is
//! parsed (JSON or form-urlencoded, picked by `content-type`) and
//! [`RequestEvent::End`] carries the result.
//!
//! `Request` is a handle. Cloning it is cheap and every clone sees the same
//! state, which is how the same request travels through every middleware.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::request::Parts;
use http::{Extensions, HeaderMap, Method, Uri};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::BodyError;
use crate::events::{self, Event, Listeners, Subscription};

/// Transport security of the connection a request arrived on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http  => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Lifecycle notifications raised by a [`Request`].
#[derive(Debug)]
pub enum RequestEvent {
    /// A body chunk, in arrival order.
    Data(Bytes),
    /// The body is complete. Carries the parsed body, if any.
    End(Option<Value>),
    /// The body was parsed successfully.
    Body(Value),
    /// The body could not be parsed, or the stream broke.
    Error(BodyError),
    /// Body reception stopped, successfully or not.
    Close,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestEventKind {
    Data,
    End,
    Body,
    Error,
    Close,
}

impl Event for RequestEvent {
    type Kind = RequestEventKind;

    fn kind(&self) -> RequestEventKind {
        match self {
            Self::Data(_)  => RequestEventKind::Data,
            Self::End(_)   => RequestEventKind::End,
            Self::Body(_)  => RequestEventKind::Body,
            Self::Error(_) => RequestEventKind::Error,
            Self::Close    => RequestEventKind::Close,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Progress {
    Receiving,
    Ended,
    Failed,
}

// ── Request ───────────────────────────────────────────────────────────────────

/// An incoming HTTP request.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

struct Inner {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote_addr: SocketAddr,
    protocol: Protocol,
    query: HashMap<String, String>,
    progress: watch::Sender<Progress>,
    state: Mutex<State>,
}

struct State {
    raw_body: BytesMut,
    parsed_body: Option<Value>,
    ended: bool,
    closed: bool,
    params: HashMap<String, String>,
    extensions: Extensions,
    listeners: Listeners<RequestEvent>,
}

impl Request {
    pub(crate) fn new(parts: Parts, remote_addr: SocketAddr, protocol: Protocol) -> Self {
        let query = parts.uri.query().map(parse_query).unwrap_or_default();
        let (progress, _) = watch::channel(Progress::Receiving);

        Self {
            inner: Arc::new(Inner {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                remote_addr,
                protocol,
                query,
                progress,
                state: Mutex::new(State {
                    raw_body: BytesMut::new(),
                    parsed_body: None,
                    ended: false,
                    closed: false,
                    params: HashMap::new(),
                    extensions: parts.extensions,
                    listeners: Listeners::new(),
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Body reception (driven by the server) ─────────────────────────────────

    /// Appends one body chunk and raises [`RequestEvent::Data`].
    ///
    /// Ignored once the body has ended or failed.
    pub(crate) fn push_chunk(&self, chunk: Bytes) {
        let listeners = {
            let mut state = self.state();
            if state.ended || *self.inner.progress.borrow() != Progress::Receiving {
                return;
            }
            state.raw_body.extend_from_slice(&chunk);
            state.listeners.take_for(RequestEventKind::Data)
        };
        events::dispatch(listeners, &RequestEvent::Data(chunk));
    }

    /// Marks the body complete, parses it and raises `Body`/`Error` then `End`.
    pub(crate) fn finish(&self) {
        let (parsed, failure, on_body, on_error, on_end) = {
            let mut state = self.state();
            if state.ended || *self.inner.progress.borrow() != Progress::Receiving {
                return;
            }
            state.ended = true;

            let content_type = self.header("content-type");
            let (parsed, failure) = match parse_body(content_type, &state.raw_body) {
                Ok(parsed) => (parsed, None),
                Err(e) => (None, Some(e)),
            };
            state.parsed_body = parsed.clone();

            let on_body = if parsed.is_some() {
                state.listeners.take_for(RequestEventKind::Body)
            } else {
                Vec::new()
            };
            let on_error = if failure.is_some() {
                state.listeners.take_for(RequestEventKind::Error)
            } else {
                Vec::new()
            };
            let on_end = state.listeners.take_for(RequestEventKind::End);
            (parsed, failure, on_body, on_error, on_end)
        };
        self.inner.progress.send_replace(Progress::Ended);

        if let Some(value) = &parsed {
            events::dispatch(on_body, &RequestEvent::Body(value.clone()));
        }
        if let Some(err) = failure {
            debug!(error = %err, "request body rejected");
            events::dispatch(on_error, &RequestEvent::Error(err));
        }
        events::dispatch(on_end, &RequestEvent::End(parsed));
    }

    /// The body stream broke before it ended. Raises [`RequestEvent::Error`];
    /// no `End` follows.
    pub(crate) fn fail(&self, err: BodyError) {
        let listeners = {
            let mut state = self.state();
            if state.ended || *self.inner.progress.borrow() != Progress::Receiving {
                return;
            }
            state.listeners.take_for(RequestEventKind::Error)
        };
        self.inner.progress.send_replace(Progress::Failed);
        events::dispatch(listeners, &RequestEvent::Error(err));
    }

    /// Raises [`RequestEvent::Close`] once.
    pub(crate) fn close(&self) {
        let listeners = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.listeners.take_for(RequestEventKind::Close)
        };
        events::dispatch(listeners, &RequestEvent::Close);
    }

    pub(crate) fn set_params(&self, params: HashMap<String, String>) {
        self.state().params = params;
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    /// Subscribes `listener` to every event of `kind`.
    ///
    /// Subscribing to `End` or `Body` after the body has already ended still
    /// delivers the final value: exactly once, on a separate tokio task, never
    /// from inside this call. Outside a tokio runtime the late delivery is
    /// skipped with a warning.
    pub fn on<F>(&self, kind: RequestEventKind, listener: F) -> Subscription
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, false, listener)
    }

    /// Like [`on`](Self::on), but the listener is dropped after its first call.
    pub fn once<F>(&self, kind: RequestEventKind, listener: F) -> Subscription
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, true, listener)
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn off(&self, sub: Subscription) -> bool {
        self.state().listeners.unsubscribe(sub)
    }

    fn subscribe<F>(&self, kind: RequestEventKind, once: bool, listener: F) -> Subscription
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        let (sub, late) = {
            let mut state = self.state();
            let sub = state.listeners.subscribe(kind, once, Arc::new(listener));
            let late = match kind {
                RequestEventKind::End if state.ended => Some(RequestEvent::End(state.parsed_body.clone())),
                RequestEventKind::Body if state.ended => state.parsed_body.clone().map(RequestEvent::Body),
                _ => None,
            };
            (sub, late)
        };

        if let Some(event) = late {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let req = self.clone();
                    runtime.spawn(async move {
                        let listener = req.state().listeners.take_one(sub);
                        if let Some(listener) = listener {
                            listener(&event);
                        }
                    });
                }
                Err(_) => warn!(?kind, "no tokio runtime, late listener will not be called"),
            }
        }
        sub
    }

    /// Waits until the body stream has terminated and returns the parsed body.
    ///
    /// Resolves immediately if that already happened. A failed stream resolves
    /// with `None`.
    pub async fn received(&self) -> Option<Value> {
        let mut rx = self.inner.progress.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|p| *p != Progress::Receiving).await;
        self.parsed_body()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn method(&self) -> &Method { &self.inner.method }
    pub fn uri(&self) -> &Uri { &self.inner.uri }
    pub fn headers(&self) -> &HeaderMap { &self.inner.headers }
    pub fn remote_addr(&self) -> SocketAddr { self.inner.remote_addr }
    pub fn ip(&self) -> IpAddr { self.inner.remote_addr.ip() }
    pub fn protocol(&self) -> Protocol { self.inner.protocol }

    /// Path without the query string. This is what routes match against.
    pub fn path(&self) -> &str { self.inner.uri.path() }

    /// Path and query, as sent by the client.
    pub fn url(&self) -> &str {
        self.inner.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }

    /// Case-insensitive header lookup. Returns the first value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a repeated header, in order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.inner.headers.get_all(name).iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.inner.headers.contains_key(name)
    }

    /// `true` iff some comma-separated `accept` entry equals `mime`,
    /// ignoring case and surrounding whitespace.
    pub fn accepts(&self, mime: &str) -> bool {
        self.header_values("accept").iter()
            .flat_map(|v| v.split(','))
            .any(|entry| entry.trim().eq_ignore_ascii_case(mime))
    }

    /// Bytes received so far.
    pub fn raw_body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state().raw_body)
    }

    /// The parsed body, once the body ended with a recognised content type.
    pub fn parsed_body(&self) -> Option<Value> {
        self.state().parsed_body.clone()
    }

    /// Deserialises the parsed body into `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.parsed_body().map(serde_json::from_value).transpose()
    }

    pub fn is_ended(&self) -> bool { self.state().ended }

    pub fn query(&self) -> &HashMap<String, String> { &self.inner.query }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.inner.query.get(key).map(String::as_str)
    }

    /// Route variables bound by the matched pattern.
    pub fn params(&self) -> HashMap<String, String> {
        self.state().params.clone()
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/:id`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<String> {
        self.state().params.get(key).cloned()
    }

    /// Stores a per-request value, shared with every later handler.
    pub fn set_state<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.state().extensions.insert(value)
    }

    pub fn state_value<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.state().extensions.get::<T>().cloned()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("remote_addr", &self.inner.remote_addr)
            .finish_non_exhaustive()
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

/// `Ok(None)` for content types we do not parse.
fn parse_body(content_type: Option<&str>, raw: &[u8]) -> Result<Option<Value>, BodyError> {
    let Some(content_type) = content_type else { return Ok(None) };

    if content_type.contains("application/json") {
        Ok(Some(serde_json::from_slice(raw)?))
    } else if content_type.contains("application/x-www-form-urlencoded") {
        let fields: Map<String, Value> = url::form_urlencoded::parse(raw)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();
        Ok(Some(Value::Object(fields)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    pub(crate) fn request(method: &str, uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        Request::new(parts, "127.0.0.1:4000".parse().unwrap(), Protocol::Http)
    }

    pub(crate) fn finished(method: &str, uri: &str, headers: &[(&str, &str)], body: &[u8]) -> Request {
        let req = request(method, uri, headers);
        if !body.is_empty() {
            req.push_chunk(Bytes::copy_from_slice(body));
        }
        req.finish();
        req
    }

    #[test]
    fn chunks_accumulate_in_arrival_order() {
        let req = request("POST", "/upload", &[]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        req.on(RequestEventKind::Data, move |ev| {
            if let RequestEvent::Data(chunk) = ev {
                sink.lock().unwrap().push(chunk.clone());
            }
        });

        for chunk in ["ab", "", "cd", "e"] {
            req.push_chunk(Bytes::from_static(chunk.as_bytes()));
        }
        req.finish();
        req.push_chunk(Bytes::from_static(b"late"));

        assert_eq!(&req.raw_body()[..], b"abcde");
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn json_body_is_parsed_on_end() {
        let req = request("POST", "/", &[("content-type", "application/json; charset=utf-8")]);
        let bodies = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&bodies);
        req.on(RequestEventKind::Body, move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        req.push_chunk(Bytes::from_static(b"{\"a\":"));
        req.push_chunk(Bytes::from_static(b"1}"));
        req.finish();

        assert_eq!(req.parsed_body(), Some(json!({ "a": 1 })));
        assert_eq!(bodies.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn truncated_json_raises_error_and_leaves_body_unset() {
        let req = request("POST", "/", &[("content-type", "application/json")]);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        req.on(RequestEventKind::Error, move |ev| {
            if let RequestEvent::Error(e) = ev {
                sink.lock().unwrap().push(e.to_string());
            }
        });
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ended);
        req.on(RequestEventKind::End, move |ev| {
            assert!(matches!(ev, RequestEvent::End(None)));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        req.push_chunk(Bytes::from_static(b"{\"a\":"));
        req.finish();

        assert!(req.parsed_body().is_none());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("failed to parse body"));
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn form_body_becomes_an_object() {
        let req = finished(
            "POST",
            "/",
            &[("content-type", "application/x-www-form-urlencoded")],
            b"name=alice&tag=a+b&tag=c%21",
        );
        assert_eq!(req.parsed_body(), Some(json!({ "name": "alice", "tag": "c!" })));
    }

    #[test]
    fn unknown_content_type_keeps_raw_bytes_only() {
        let req = finished("POST", "/", &[("content-type", "text/plain")], b"{\"a\":1}");
        assert!(req.parsed_body().is_none());
        assert_eq!(&req.raw_body()[..], b"{\"a\":1}");

        let req = finished("POST", "/", &[], b"{\"a\":1}");
        assert!(req.parsed_body().is_none());
    }

    #[test]
    fn headers_and_accepts_ignore_case() {
        let req = request("GET", "/x", &[
            ("Accept", "text/html, Application/JSON"),
            ("accept", "image/png"),
            ("X-Trace", "abc"),
        ]);
        assert_eq!(req.header("x-trace"), Some("abc"));
        assert_eq!(req.header("X-TRACE"), Some("abc"));
        assert!(req.has_header("x-Trace"));
        assert!(req.accepts("application/json"));
        assert!(req.accepts("IMAGE/PNG"));
        assert!(!req.accepts("text/plain"));
        assert!(!request("GET", "/", &[]).accepts("text/html"));
    }

    #[test]
    fn url_path_and_query() {
        let req = request("get", "/search?q=rust&page=2&q=tokio", &[]);
        assert_eq!(req.path(), "/search");
        assert_eq!(req.url(), "/search?q=rust&page=2&q=tokio");
        assert_eq!(req.query_param("q"), Some("tokio"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.ip().to_string(), "127.0.0.1");
        assert_eq!(req.protocol().as_str(), "http");
    }

    #[tokio::test]
    async fn late_end_listener_fires_once_and_not_inline() {
        let req = finished("POST", "/", &[("content-type", "application/json")], b"{\"a\":1}");
        let (tx, mut rx) = mpsc::unbounded_channel();

        req.on(RequestEventKind::End, move |ev| {
            if let RequestEvent::End(body) = ev {
                tx.send(body.clone()).unwrap();
            }
        });
        assert!(rx.try_recv().is_err(), "delivered synchronously");

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(Some(json!({ "a": 1 }))));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "delivered twice");
    }

    #[tokio::test]
    async fn late_body_listener_fires_once_with_parsed_body() {
        let req = finished("POST", "/", &[("content-type", "application/x-www-form-urlencoded")], b"a=1");
        let (tx, mut rx) = mpsc::unbounded_channel();

        req.on(RequestEventKind::Body, move |ev| {
            if let RequestEvent::Body(value) = ev {
                tx.send(value.clone()).unwrap();
            }
        });
        assert!(rx.try_recv().is_err(), "delivered synchronously");

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(json!({ "a": "1" })));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "delivered twice");
    }

    #[test]
    fn late_listener_outside_a_runtime_does_not_panic() {
        let req = finished("POST", "/", &[("content-type", "application/json")], b"{}");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let sub = req.on(RequestEventKind::End, move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(req.off(sub));
    }

    #[tokio::test]
    async fn late_body_listener_skipped_without_parsed_body() {
        let req = finished("POST", "/", &[], b"raw");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        req.once(RequestEventKind::Body, move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_listener_removed_before_delivery_stays_silent() {
        let req = finished("POST", "/", &[], b"");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = req.on(RequestEventKind::End, move |_| { counter.fetch_add(1, Ordering::SeqCst); });
        assert!(req.off(sub));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn received_waits_for_end() {
        let req = request("POST", "/", &[("content-type", "application/json")]);
        let waiter = req.clone();
        let handle = tokio::spawn(async move { waiter.received().await });

        req.push_chunk(Bytes::from_static(b"[1,2]"));
        req.finish();

        assert_eq!(handle.await.unwrap(), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn stream_failure_ends_reception_without_end_event() {
        let req = request("POST", "/", &[]);
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ended);
        req.on(RequestEventKind::End, move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        req.push_chunk(Bytes::from_static(b"part"));
        req.fail(BodyError::Stream("reset".into()));
        req.finish();

        assert_eq!(req.received().await, None);
        assert!(!req.is_ended());
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn state_is_shared_between_clones() {
        #[derive(Clone, Debug, PartialEq)]
        struct User(u32);

        let req = request("GET", "/", &[]);
        req.clone().set_state(User(7));
        assert_eq!(req.state_value::<User>(), Some(User(7)));
    }
}
