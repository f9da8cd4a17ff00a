//! Comparison of observed messages with the declared ones.

use std::{collections::BTreeMap, fmt, time::Duration};

use crate::message::{date::parse_http_date, Message, StartLine};

/// `Warning` values an intermediary may add on its own
pub const REGISTERED_WARNINGS: &[&str] = &[
    "110 - Response is stale",
    "111 - Revalidation Failed",
    "112 - Disconnected Operation",
    "113 - Heuristic Expiration",
    "199 - Miscellaneous Warning",
    "214 - Transformation Applied",
    "299 - Miscellaneous Persistent Warning",
];

/// One difference between a declared and an observed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    /// method, uri, status, reason, version, or message kind
    StartLine {
        field: &'static str,
        expected: String,
        received: String,
    },
    Header {
        name: String,
        expected: Vec<String>,
        received: Vec<String>,
    },
    Trailer {
        name: String,
        expected: Vec<String>,
        received: Vec<String>,
    },
    Body {
        expected_len: usize,
        received_len: usize,
        /// offset of the first differing byte
        offset: usize,
    },
    /// the message was cut by a connection close
    Incomplete,
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diff::StartLine {
                field,
                expected,
                received,
            } => write!(f, "{field}: expected '{expected}', received '{received}'"),
            Diff::Header {
                name,
                expected,
                received,
            } => write!(f, "header {name}: expected {expected:?}, received {received:?}"),
            Diff::Trailer {
                name,
                expected,
                received,
            } => write!(f, "trailer {name}: expected {expected:?}, received {received:?}"),
            Diff::Body {
                expected_len,
                received_len,
                offset,
            } => write!(
                f,
                "body: expected {expected_len} bytes, received {received_len}, first difference at byte {offset}"
            ),
            Diff::Incomplete => write!(f, "message cut by a connection close"),
        }
    }
}

pub trait Comparator: fmt::Debug {
    fn compare(&self, expected: &Message, received: &Message) -> Vec<Diff>;
}

/// Field by field comparison.
///
/// Header names compare case-insensitively and values exactly, in order,
/// except for the fields an intermediary legitimately alters:
/// * `Date` only needs to be within the tolerance when both sides have one,
/// * `Age` only needs to grow, or be a valid age when not declared,
/// * `Connection` may be dropped, or added as `close` or `keep-alive`,
/// * `Warning` may be added from the registered list.
#[derive(Debug, Clone)]
pub struct FieldComparator {
    pub date_tolerance: Duration,
    /// lowercase names left out of the comparison
    pub ignored_headers: Vec<String>,
    pub compare_body: bool,
}

impl Default for FieldComparator {
    fn default() -> Self {
        FieldComparator {
            date_tolerance: Duration::from_secs(5),
            ignored_headers: Vec::new(),
            compare_body: true,
        }
    }
}

impl FieldComparator {
    pub fn new(date_tolerance: Duration) -> Self {
        FieldComparator {
            date_tolerance,
            ..Default::default()
        }
    }

    pub fn ignore_header(mut self, name: &str) -> Self {
        self.ignored_headers.push(name.to_ascii_lowercase());
        self
    }

    pub fn without_body(mut self) -> Self {
        self.compare_body = false;
        self
    }

    fn compare_start_line(expected: &Message, received: &Message, diffs: &mut Vec<Diff>) {
        let mut field = |field, expected: &str, received: &str| {
            if expected != received {
                diffs.push(Diff::StartLine {
                    field,
                    expected: expected.to_owned(),
                    received: received.to_owned(),
                });
            }
        };
        match (&expected.start, &received.start) {
            (
                StartLine::Request { method, uri },
                StartLine::Request {
                    method: received_method,
                    uri: received_uri,
                },
            ) => {
                field("method", method, received_method);
                field("uri", uri, received_uri);
            }
            (
                StartLine::Response { status, reason },
                StartLine::Response {
                    status: received_status,
                    reason: received_reason,
                },
            ) => {
                field("status", &status.to_string(), &received_status.to_string());
                field(
                    "reason",
                    reason.as_deref().unwrap_or_default(),
                    received_reason.as_deref().unwrap_or_default(),
                );
            }
            (expected_start, _) => field(
                "kind",
                kind(expected_start),
                kind(&received.start),
            ),
        }
        field("version", expected.version.as_str(), received.version.as_str());
    }

    fn compare_fields(
        &self,
        mut expected: BTreeMap<String, Vec<String>>,
        mut received: BTreeMap<String, Vec<String>>,
    ) -> Vec<(String, Vec<String>, Vec<String>)> {
        for name in &self.ignored_headers {
            expected.remove(name);
            received.remove(name);
        }

        let mut mismatches = Vec::new();
        let mut mismatch = |name: &str, expected: Vec<String>, received: Vec<String>| {
            mismatches.push((name.to_owned(), expected, received));
        };

        if expected.get("date").map_or(0, Vec::len) == 1
            && received.get("date").map_or(0, Vec::len) == 1
        {
            let expected_date = expected.remove("date").unwrap_or_default();
            let received_date = received.remove("date").unwrap_or_default();
            if !self.dates_match(&expected_date[0], &received_date[0]) {
                mismatch("date", expected_date, received_date);
            }
        }

        let expected_age = expected.remove("age").unwrap_or_default();
        let received_age = received.remove("age").unwrap_or_default();
        let age_ok = match (expected_age.as_slice(), received_age.as_slice()) {
            ([expected], [received]) => {
                matches!((parse_age(expected), parse_age(received)), (Some(e), Some(r)) if r >= e)
            }
            (_, []) => true,
            (_, [received]) => parse_age(received).is_some(),
            _ => false,
        };
        if !age_ok {
            mismatch("age", expected_age, received_age);
        }

        let expected_connection = expected.remove("connection").unwrap_or_default();
        let received_connection = received.remove("connection").unwrap_or_default();
        let connection_ok = if !expected_connection.is_empty() && !received_connection.is_empty() {
            expected_connection == received_connection
        } else {
            match received_connection.as_slice() {
                [] => true,
                [value] => value == "close" || value == "keep-alive",
                _ => false,
            }
        };
        if !connection_ok {
            mismatch("connection", expected_connection, received_connection);
        }

        let expected_warning = expected.remove("warning").unwrap_or_default();
        let received_warning = received.remove("warning").unwrap_or_default();
        let warning_ok = if !expected_warning.is_empty() && !received_warning.is_empty() {
            expected_warning == received_warning
        } else {
            received_warning
                .iter()
                .all(|warning| REGISTERED_WARNINGS.contains(&warning.as_str()))
        };
        if !warning_ok {
            mismatch("warning", expected_warning, received_warning);
        }

        let mut names: Vec<&String> = expected.keys().chain(received.keys()).collect();
        names.sort_unstable();
        names.dedup();
        for name in names {
            let expected_values = expected.get(name).cloned().unwrap_or_default();
            let received_values = received.get(name).cloned().unwrap_or_default();
            if expected_values != received_values {
                mismatch(name.as_str(), expected_values, received_values);
            }
        }
        mismatches
    }

    /// within half the tolerance on each side
    fn dates_match(&self, expected: &str, received: &str) -> bool {
        match (parse_http_date(expected), parse_http_date(received)) {
            (Some(expected), Some(received)) => {
                let half = self.date_tolerance.as_secs_f64() / 2.0;
                let delta = (received - expected).as_seconds_f64();
                delta.abs() <= half
            }
            _ => expected == received,
        }
    }
}

fn kind(start: &StartLine) -> &'static str {
    match start {
        StartLine::Request { .. } => "request",
        StartLine::Response { .. } => "response",
    }
}

fn parse_age(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

impl Comparator for FieldComparator {
    fn compare(&self, expected: &Message, received: &Message) -> Vec<Diff> {
        let mut diffs = Vec::new();
        FieldComparator::compare_start_line(expected, received, &mut diffs);

        for (name, expected, received) in self.compare_fields(
            expected.headers.as_lowercase_map(),
            received.headers.as_lowercase_map(),
        ) {
            diffs.push(Diff::Header {
                name,
                expected,
                received,
            });
        }
        for (name, expected, received) in self.compare_fields(
            expected.trailers.as_lowercase_map(),
            received.trailers.as_lowercase_map(),
        ) {
            diffs.push(Diff::Trailer {
                name,
                expected,
                received,
            });
        }

        if self.compare_body && expected.body != received.body {
            let offset = expected
                .body
                .iter()
                .zip(&received.body)
                .take_while(|(a, b)| a == b)
                .count();
            diffs.push(Diff::Body {
                expected_len: expected.body.len(),
                received_len: received.body.len(),
                offset,
            });
        }
        if expected.complete && !received.complete {
            diffs.push(Diff::Incomplete);
        }
        diffs
    }
}

/// Which message of a step a problem is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Response,
    ForwardedRequest,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Response => write!(f, "response"),
            Subject::ForwardedRequest => write!(f, "forwarded request"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// declared but never observed before the deadline
    Missing(Subject),
    /// observed while none was declared
    Unexpected(Subject),
    /// bytes that could not be parsed as a message
    Malformed { subject: Subject, diagnostic: String },
    Field { subject: Subject, diff: Diff },
    /// filter precondition, pairing or eviction problem
    Violation(String),
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Missing(subject) => write!(f, "no {subject} received"),
            Mismatch::Unexpected(subject) => write!(f, "unexpected {subject}"),
            Mismatch::Malformed {
                subject,
                diagnostic,
            } => write!(f, "malformed {subject}: {diagnostic}"),
            Mismatch::Field { subject, diff } => write!(f, "{subject} {diff}"),
            Mismatch::Violation(message) => write!(f, "violation: {message}"),
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectationResult {
    pub step: usize,
    pub diffs: Vec<Mismatch>,
}

impl ExpectationResult {
    pub fn new(step: usize) -> Self {
        ExpectationResult {
            step,
            diffs: Vec::new(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn push_diffs(&mut self, subject: Subject, diffs: Vec<Diff>) {
        self.diffs
            .extend(diffs.into_iter().map(|diff| Mismatch::Field { subject, diff }));
    }

    /// the declared response or forwarded request never arrived
    pub fn is_unmatched(&self) -> bool {
        self.diffs
            .iter()
            .any(|diff| matches!(diff, Mismatch::Missing(_)))
    }
}

impl fmt::Display for ExpectationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pass() {
            return write!(f, "step {}: pass", self.step);
        }
        write!(f, "step {}: {} mismatches", self.step, self.diffs.len())?;
        for diff in &self.diffs {
            write!(f, "\n  - {diff}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Version;

    fn response() -> Message {
        Message::response(200)
            .header("Content-Length", "5")
            .header("Server", "origin")
            .header("Date", "Mon, 12 Dec 2016 13:59:39 GMT")
            .body("hello")
    }

    #[test]
    fn identical_messages() {
        let comparator = FieldComparator::default();
        assert!(comparator.compare(&response(), &response()).is_empty());
    }

    #[test]
    fn start_line_and_body() {
        let comparator = FieldComparator::default();
        let mut received = response().version(Version::Http10).body("hellO");
        received.set_status(201);
        let diffs = comparator.compare(&response(), &received);
        assert_eq!(
            diffs,
            vec![
                Diff::StartLine {
                    field: "status",
                    expected: "200".into(),
                    received: "201".into()
                },
                Diff::StartLine {
                    field: "reason",
                    expected: "OK".into(),
                    received: "Created".into()
                },
                Diff::StartLine {
                    field: "version",
                    expected: "HTTP/1.1".into(),
                    received: "HTTP/1.0".into()
                },
                Diff::Body {
                    expected_len: 5,
                    received_len: 5,
                    offset: 4
                },
            ]
        );

        let request = Message::request("GET", "/");
        let diffs = comparator.compare(&request, &Message::request("GET", "/other"));
        assert_eq!(diffs.len(), 1);
        assert!(matches!(&diffs[0], Diff::StartLine { field: "uri", .. }));
        let diffs = comparator.compare(&request, &response());
        assert!(matches!(&diffs[0], Diff::StartLine { field: "kind", .. }));
    }

    #[test]
    fn header_names_are_case_insensitive_values_are_not() {
        let comparator = FieldComparator::default();
        let mut received = response();
        received.headers = received
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_uppercase(), value.to_owned()))
            .collect();
        assert!(comparator.compare(&response(), &received).is_empty());

        received.headers.set("server", "Origin");
        assert_eq!(
            comparator.compare(&response(), &received),
            vec![Diff::Header {
                name: "server".into(),
                expected: vec!["origin".into()],
                received: vec!["Origin".into()],
            }]
        );

        let extra = response().header("X-Extra", "1");
        assert_eq!(comparator.compare(&response(), &extra).len(), 1);
        assert!(comparator
            .clone()
            .ignore_header("X-Extra")
            .compare(&response(), &extra)
            .is_empty());
    }

    #[test]
    fn date_tolerance() {
        let comparator = FieldComparator::new(Duration::from_secs(4));
        let mut received = response();
        received.headers.set("date", "Mon, 12 Dec 2016 13:59:41 GMT");
        assert!(comparator.compare(&response(), &received).is_empty());
        received.headers.set("date", "Mon, 12 Dec 2016 13:59:42 GMT");
        assert_eq!(comparator.compare(&response(), &received).len(), 1);

        received.headers.remove_all("date");
        assert_eq!(comparator.compare(&response(), &received).len(), 1);
    }

    #[test]
    fn age_connection_and_warning() {
        let comparator = FieldComparator::default();
        let expected = response();

        let added = response()
            .header("Age", "3")
            .header("Connection", "keep-alive")
            .header("Warning", "110 - Response is stale");
        assert!(comparator.compare(&expected, &added).is_empty());

        let invalid = response()
            .header("Age", "-1")
            .header("Connection", "upgrade")
            .header("Warning", "999 - Made up");
        let names: Vec<String> = comparator
            .compare(&expected, &invalid)
            .into_iter()
            .filter_map(|diff| match diff {
                Diff::Header { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["age", "connection", "warning"]);

        let older = expected.clone().header("Age", "10");
        assert!(comparator
            .compare(&older, &response().header("Age", "12"))
            .is_empty());
        assert_eq!(
            comparator
                .compare(&older, &response().header("Age", "8"))
                .len(),
            1
        );

        let declared = expected.clone().header("Connection", "close");
        assert!(comparator.compare(&declared, &response()).is_empty());
        assert_eq!(
            comparator
                .compare(&declared, &response().header("Connection", "keep-alive"))
                .len(),
            1
        );
    }

    #[test]
    fn result_display() {
        let mut result = ExpectationResult::new(2);
        assert!(result.is_pass());
        assert_eq!(result.to_string(), "step 2: pass");

        result.diffs.push(Mismatch::Missing(Subject::ForwardedRequest));
        result.push_diffs(Subject::Response, vec![Diff::Incomplete]);
        assert!(!result.is_pass());
        assert!(result.is_unmatched());
        assert_eq!(
            result.to_string(),
            "step 2: 2 mismatches\n  - no forwarded request received\n  - response message cut by a connection close"
        );
    }
}
