//! Filters rewrite a step's expectations before it runs, for behaviors
//! that depend on the request itself.

use crate::{
    chain::MessageChain,
    message::{date::parse_http_date, Message},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter {filter} needs a declared 200 response, found {status:?}")]
    NotOk {
        filter: &'static str,
        status: Option<u16>,
    },
    #[error("filter {filter} needs a declared response")]
    MissingResponse { filter: &'static str },
}

pub trait Filter: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// rewrite the expectations of `step` in place
    fn apply(&self, step: &mut MessageChain) -> Result<(), FilterError>;
}

/// headers a 304 keeps from the full response
pub const NOT_MODIFIED_HEADERS: &[&str] = &[
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "vary",
    "connection",
];

/// Expects a 304 for conditional requests matching the declared
/// representation.
///
/// `If-None-Match` wins over `If-Modified-Since`, which is only looked at
/// when the former is absent. Entity tags compare weakly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalCache;

impl ConditionalCache {
    pub const NAME: &'static str = "conditional-cache";

    /// whether `request` matches the representation described by `response`
    pub fn matches(request: &Message, response: &Message) -> bool {
        let none_match = request.headers.get_all("if-none-match");
        if !none_match.is_empty() {
            let etag = match response.headers.get("etag") {
                Some(etag) => normalize_etag(etag),
                None => {
                    return none_match
                        .iter()
                        .flat_map(|value| value.split(','))
                        .any(|tag| tag.trim() == "*")
                }
            };
            return none_match
                .iter()
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .any(|tag| tag == "*" || weak_eq(&normalize_etag(tag), &etag));
        }

        match (
            request
                .headers
                .get("if-modified-since")
                .and_then(parse_http_date),
            response
                .headers
                .get("last-modified")
                .and_then(parse_http_date),
        ) {
            (Some(since), Some(modified)) => modified <= since,
            _ => false,
        }
    }
}

impl Filter for ConditionalCache {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&self, step: &mut MessageChain) -> Result<(), FilterError> {
        let conditional = step.request.headers.contains("if-none-match")
            || step.request.headers.contains("if-modified-since");
        if !conditional {
            return Ok(());
        }

        let response = step
            .response
            .as_mut()
            .ok_or(FilterError::MissingResponse { filter: Self::NAME })?;
        if response.status() != Some(200) {
            return Err(FilterError::NotOk {
                filter: Self::NAME,
                status: response.status(),
            });
        }
        if !ConditionalCache::matches(&step.request, response) {
            return Ok(());
        }

        debug!(
            "FILTER\t{}: {} becomes 304 Not Modified",
            Self::NAME,
            step.request
        );
        response.set_status(304);
        response
            .headers
            .retain(|name, _| NOT_MODIFIED_HEADERS.iter().any(|kept| name.eq_ignore_ascii_case(kept)));
        if let Some(etag) = response.headers.get("etag").map(normalize_etag) {
            response.headers.set("etag", etag);
        }
        response.body.clear();
        response.trailers = Default::default();
        Ok(())
    }
}

/// Quote an entity tag, keeping a weak prefix: ` abc ` gives `"abc"`
pub fn normalize_etag(tag: &str) -> String {
    let tag = tag.trim();
    let (weak, opaque) = match tag.strip_prefix("W/") {
        Some(rest) => ("W/", rest.trim()),
        None => ("", tag),
    };
    if opaque.len() >= 2 && opaque.starts_with('"') && opaque.ends_with('"') {
        format!("{weak}{opaque}")
    } else {
        format!("{weak}\"{}\"", opaque.trim_matches('"'))
    }
}

fn weak_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

pub fn filter_by_name(name: &str) -> Option<Box<dyn Filter>> {
    match name {
        ConditionalCache::NAME => Some(Box::new(ConditionalCache)),
        _ => None,
    }
}
