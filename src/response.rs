//! Outgoing HTTP response type.
//!
//! A [`Response`] stages status, headers and body until one terminal call
//! (`send`, `json`, `end`, `redirect`, `download`) flushes them. Flushing
//! happens exactly once: every later terminal call, and every later mutation,
//! is silently absorbed.
//!
//! There are two ways out:
//!
//! | Call | Status and headers written |
//! |---|---|
//! | [`send`](Response::send) / [`json`](Response::json) | the staged ones |
//! | [`end`](Response::end) | the raw head only (200, no headers unless `redirect` wrote them) |
//!
//! `end` is the raw path on purpose. Stage headers with `set_header` only if
//! you finish with `send`.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::Full;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::Error;
use crate::events::{self, Event, Listeners, Subscription};

/// The single message a response produces on flush.
pub(crate) type Reply = http::Response<Full<Bytes>>;

// ── ContentType ───────────────────────────────────────────────────────────────

pub(crate) const JSON: &str = "application/json";

// ── Events ────────────────────────────────────────────────────────────────────

/// Notifications raised by a [`Response`] when it flushes.
#[derive(Debug)]
pub enum ResponseEvent {
    /// Flushed by `send` (or `json`, `download`) with this body.
    Send(Bytes),
    /// Flushed by `end` (or `redirect`) with this body.
    End(Option<Bytes>),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResponseEventKind {
    Send,
    End,
}

impl Event for ResponseEvent {
    type Kind = ResponseEventKind;

    fn kind(&self) -> ResponseEventKind {
        match self {
            Self::Send(_) => ResponseEventKind::Send,
            Self::End(_)  => ResponseEventKind::End,
        }
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// ```rust,no_run
/// # async fn handler(res: aero::Response) -> Result<(), aero::Error> {
/// res.status(201)
///     .set_header("Location", "/users/42")
///     .json(&serde_json::json!({ "id": 42 }))?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Response {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    status: u16,
    headers: Vec<(String, Vec<String>)>,
    body: Option<Bytes>,
    headers_sent: bool,
    raw: RawHead,
    sink: Option<oneshot::Sender<Reply>>,
    listeners: Listeners<ResponseEvent>,
}

/// What goes on the wire when `end` bypasses the staged state.
struct RawHead {
    status: u16,
    headers: Vec<(String, Vec<String>)>,
}

impl Response {
    /// A fresh response and the receiving end of its flush.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let inner = Inner {
            status: 200,
            headers: Vec::new(),
            body: None,
            headers_sent: false,
            raw: RawHead { status: 200, headers: Vec::new() },
            sink: Some(tx),
            listeners: Listeners::new(),
        };
        (Self { inner: Arc::new(Mutex::new(inner)) }, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Staging ───────────────────────────────────────────────────────────────

    /// Stages the status code.
    pub fn status(&self, code: u16) -> &Self {
        let mut inner = self.lock();
        if !inner.headers_sent {
            inner.status = code;
        }
        self
    }

    /// Stages a header, replacing any previous value. Names are case-insensitive.
    pub fn set_header(&self, name: &str, value: impl Into<String>) -> &Self {
        self.set_header_values(name, [value.into()])
    }

    /// Stages a multi-value header, replacing any previous value.
    pub fn set_header_values<I, V>(&self, name: &str, values: I) -> &Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let mut inner = self.lock();
        if !inner.headers_sent {
            put(&mut inner.headers, name, values);
        }
        self
    }

    pub fn remove_header(&self, name: &str) -> &Self {
        let mut inner = self.lock();
        if !inner.headers_sent {
            let key = name.to_ascii_lowercase();
            inner.headers.retain(|(k, _)| *k != key);
        }
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.lock().headers.iter().any(|(k, _)| *k == key)
    }

    /// The staged value; multiple values are joined with `, `.
    pub fn header(&self, name: &str) -> Option<String> {
        let key = name.to_ascii_lowercase();
        self.lock().headers.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.join(", "))
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        let key = name.to_ascii_lowercase();
        self.lock().headers.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Sets `Content-Type`.
    pub fn content_type(&self, content_type: &str) -> &Self {
        self.set_header("Content-Type", content_type)
    }

    /// Sets `Content-Disposition` to `attachment`, with a filename if given.
    pub fn attachment(&self, filename: Option<&str>) -> &Self {
        match filename {
            Some(name) => self.set_header("Content-Disposition", format!("attachment; filename=\"{name}\"")),
            None => self.set_header("Content-Disposition", "attachment"),
        }
    }

    pub fn status_code(&self) -> u16 { self.lock().status }
    pub fn headers_sent(&self) -> bool { self.lock().headers_sent }

    /// The body handed to the first `send`, if any.
    pub fn body(&self) -> Option<Bytes> { self.lock().body.clone() }

    // ── Terminal calls ────────────────────────────────────────────────────────

    /// Flushes the staged status and headers with `body`.
    pub fn send(&self, body: impl Into<Bytes>) {
        let body = body.into();
        let listeners = {
            let mut inner = self.lock();
            if inner.headers_sent {
                return;
            }
            inner.body = Some(body.clone());
            let status = inner.status;
            inner.raw.status = status;
            let staged = inner.headers.clone();
            for (name, values) in staged {
                put(&mut inner.raw.headers, &name, values);
            }
            inner.commit(Some(body.clone()));
            inner.listeners.take_for(ResponseEventKind::Send)
        };
        events::dispatch(listeners, &ResponseEvent::Send(body));
    }

    /// Serialises `body` and sends it as `application/json`.
    pub fn json<T: Serialize + ?Sized>(&self, body: &T) -> Result<(), Error> {
        if self.headers_sent() {
            return Ok(());
        }
        let bytes = serde_json::to_vec(body)?;
        self.content_type(JSON);
        self.send(bytes);
        Ok(())
    }

    /// Flushes the raw head with `data`. Staged status and headers are not
    /// applied.
    pub fn end(&self, data: Option<Bytes>) {
        let listeners = {
            let mut inner = self.lock();
            if inner.headers_sent {
                return;
            }
            inner.commit(data.clone());
            inner.listeners.take_for(ResponseEventKind::End)
        };
        events::dispatch(listeners, &ResponseEvent::End(data));
    }

    /// `302 Found` to `url`.
    pub fn redirect(&self, url: &str) {
        self.redirect_with(url, 302);
    }

    /// Redirects with an explicit status code. Status and `Location` are
    /// staged and written onto the raw head, then the response is ended
    /// without a body.
    pub fn redirect_with(&self, url: &str, code: u16) {
        {
            let mut inner = self.lock();
            if inner.headers_sent {
                return;
            }
            inner.status = code;
            put(&mut inner.headers, "location", vec![url.to_owned()]);
            inner.raw.status = code;
            put(&mut inner.raw.headers, "location", vec![url.to_owned()]);
        }
        self.end(None);
    }

    /// Reads the file at `path` into memory and sends it as an attachment.
    pub async fn download(&self, path: impl AsRef<Path>, filename: Option<&str>) -> Result<(), Error> {
        let data = tokio::fs::read(path).await?;
        self.attachment(filename);
        self.send(data);
        Ok(())
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: ResponseEventKind, listener: F) -> Subscription
    where
        F: Fn(&ResponseEvent) + Send + Sync + 'static,
    {
        self.lock().listeners.subscribe(kind, false, Arc::new(listener))
    }

    pub fn once<F>(&self, kind: ResponseEventKind, listener: F) -> Subscription
    where
        F: Fn(&ResponseEvent) + Send + Sync + 'static,
    {
        self.lock().listeners.subscribe(kind, true, Arc::new(listener))
    }

    pub fn off(&self, sub: Subscription) -> bool {
        self.lock().listeners.unsubscribe(sub)
    }
}

impl Inner {
    /// Builds the wire response from the raw head and hands it over.
    fn commit(&mut self, body: Option<Bytes>) {
        self.headers_sent = true;

        let status = StatusCode::from_u16(self.raw.status).unwrap_or_else(|_| {
            warn!(status = self.raw.status, "invalid status code, sending 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });
        let mut reply = http::Response::new(Full::new(body.unwrap_or_default()));
        *reply.status_mut() = status;

        for (name, values) in &self.raw.headers {
            let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
                warn!(header = %name, "dropping invalid header name");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => { reply.headers_mut().append(header.clone(), value); }
                    Err(_) => warn!(header = %name, "dropping invalid header value"),
                }
            }
        }

        if let Some(sink) = self.sink.take() {
            if sink.send(reply).is_err() {
                debug!("client went away before the response was flushed");
            }
        }
    }
}

/// Last write wins; keys are stored lower-cased.
fn put(headers: &mut Vec<(String, Vec<String>)>, name: &str, values: Vec<String>) {
    let key = name.to_ascii_lowercase();
    match headers.iter_mut().find(|(k, _)| *k == key) {
        Some((_, slot)) => *slot = values,
        None => headers.push((key, values)),
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Response")
            .field("status", &inner.status)
            .field("headers_sent", &inner.headers_sent)
            .finish_non_exhaustive()
    }
}
