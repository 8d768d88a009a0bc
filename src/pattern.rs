//! Route path patterns.
//!
//! A pattern like `/users/:id/posts` is parsed once, at registration, into
//! literal and variable segments. Matching walks the request path segment by
//! segment: O(segments), no regex.
//!
//! - Literal segments compare byte-for-byte (case-sensitive).
//! - `:name` binds exactly one non-empty segment, percent-decoded.
//! - One trailing slash is ignored on both sides, so `/users/` matches
//!   `/users`.

use std::collections::HashMap;

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Clone, Debug)]
pub(crate) struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    pub(crate) fn parse(path: &str) -> Self {
        let segments = split(path)
            .map(|s| match s.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_owned()),
                _ => Segment::Literal(s.to_owned()),
            })
            .collect();
        Self { segments }
    }

    /// Route variables on success.
    pub(crate) fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut parts = split(path);

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), decode(part));
                }
            }
        }

        parts.next().is_none().then_some(params)
    }
}

/// Percent-decodes a bound segment. `+` stays literal in paths. A segment
/// that does not decode to UTF-8 is kept as sent.
fn decode(segment: &str) -> String {
    urlencoding::decode(segment).map_or_else(|_| segment.to_owned(), |s| s.into_owned())
}

fn split(path: &str) -> std::str::Split<'_, char> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    let mut parts = path.split('/');
    if path.is_empty() {
        // `/` has no segments.
        parts.next();
    }
    parts
}
