//! Method and path-pattern routing.
//!
//! Patterns are literal paths with `{name}` placeholders, each matching one
//! non-empty segment that contains no `/`. Routes are evaluated in
//! registration order and the first match wins, so overlapping patterns must
//! be registered most specific first.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Errors raised while compiling a route pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// The pattern does not start with `/`.
    #[error("route pattern must start with '/': {pattern:?}")]
    NotAbsolute {
        /// Offending pattern.
        pattern: String,
    },
    /// A `{` placeholder is unterminated, empty, or shares a segment.
    #[error("invalid placeholder in route pattern {pattern:?}")]
    InvalidPlaceholder {
        /// Offending pattern.
        pattern: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
struct Route<H> {
    method: String,
    pattern: String,
    segments: Vec<Segment>,
    handler: H,
}

impl<H> Route<H> {
    fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut parts = path.split('/');
        let mut params = HashMap::new();
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_owned());
                }
            }
        }
        parts.next().is_none().then_some(params)
    }
}

/// Result of a successful route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<H> {
    /// Handler registered for the route.
    pub handler: H,
    /// Pattern the request matched.
    pub pattern: String,
    /// Values captured by `{name}` placeholders.
    pub path_params: HashMap<String, String>,
    /// Percent-decoded query string parameters.
    pub query_params: HashMap<String, String>,
}

/// Ordered route table.
///
/// Built once at startup; lookups never mutate it.
#[derive(Debug, Clone)]
pub struct Router<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H: Copy> Router<H> {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` and `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when the pattern is not absolute or contains a
    /// malformed placeholder.
    pub fn add_route(&mut self, method: &str, pattern: &str, handler: H) -> Result<(), RouteError> {
        let segments = compile(pattern)?;
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            pattern: pattern.to_owned(),
            segments,
            handler,
        });
        Ok(())
    }

    /// Finds the first route matching `method` and `raw_path`.
    ///
    /// Any query string is stripped before matching and decoded separately.
    #[must_use]
    pub fn find(&self, method: &str, raw_path: &str) -> Option<RouteMatch<H>> {
        let (path, query) = split_query(raw_path);
        self.routes
            .iter()
            .filter(|route| route.method.eq_ignore_ascii_case(method))
            .find_map(|route| {
                route.captures(path).map(|path_params| RouteMatch {
                    handler: route.handler,
                    pattern: route.pattern.clone(),
                    path_params,
                    query_params: parse_query(query),
                })
            })
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Reports whether no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Iterates over `(method, pattern)` pairs in registration order.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes
            .iter()
            .map(|route| (route.method.as_str(), route.pattern.as_str()))
    }
}

fn compile(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    if !pattern.starts_with('/') {
        return Err(RouteError::NotAbsolute {
            pattern: pattern.to_owned(),
        });
    }
    pattern
        .split('/')
        .map(|segment| {
            if !segment.contains(['{', '}']) {
                return Ok(Segment::Literal(segment.to_owned()));
            }
            segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .filter(|name| {
                    !name.is_empty()
                        && name
                            .chars()
                            .all(|character| character.is_alphanumeric() || character == '_')
                })
                .map(|name| Segment::Param(name.to_owned()))
                .ok_or_else(|| RouteError::InvalidPlaceholder {
                    pattern: pattern.to_owned(),
                })
        })
        .collect()
}

/// Splits a raw request path at the first `?`.
#[must_use]
pub fn split_query(raw_path: &str) -> (&str, Option<&str>) {
    match raw_path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw_path, None),
    }
}

/// Decodes `key=value` pairs from a query string.
///
/// Keys and values are percent-decoded, pairs without `=` are ignored, and
/// the last occurrence of a duplicate key wins.
#[must_use]
pub fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .into_iter()
        .flat_map(|text| text.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (decode(key), decode(value)))
        .collect()
}

fn decode(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}
