//! HTTP messages as the harness sees them: a start line, an ordered header
//! list, a body and trailers, all kept exactly as declared or received.
//!
//! Nothing here validates what it is given. A message with an empty header
//! name, a bogus version or a body contradicting its `Content-Length` is
//! serialized as is, the parsers are the only place where validity matters.

pub mod date;
pub mod frame;
pub mod h1;
pub mod h2;
pub mod headers;

use std::fmt;

use time::OffsetDateTime;

pub use crate::message::headers::HeaderList;

/// Result of an incremental parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    /// a full item and the number of bytes it used
    Complete(T, usize),
    /// more bytes are needed
    Incomplete,
    /// the bytes can never form a valid item
    Malformed(String),
}

impl<T> Parsed<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Parsed::Complete(..))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Parsed<U> {
        match self {
            Parsed::Complete(item, size) => Parsed::Complete(f(item), size),
            Parsed::Incomplete => Parsed::Incomplete,
            Parsed::Malformed(diagnostic) => Parsed::Malformed(diagnostic),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
    Http2,
    /// anything else, emitted verbatim
    Other(String),
}

impl Version {
    pub fn from_token(token: &str) -> Version {
        match token {
            "HTTP/1.0" => Version::Http10,
            "HTTP/1.1" => Version::Http11,
            "HTTP/2" | "HTTP/2.0" => Version::Http2,
            other => Version::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
            Version::Other(token) => token,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        uri: String,
    },
    Response {
        status: u16,
        /// `None` drops the reason and its separating space from the status line
        reason: Option<String>,
    },
}

/// One HTTP request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub start: StartLine,
    pub version: Version,
    pub headers: HeaderList,
    /// as on the wire: still chunk encoded for chunked messages, up to and
    /// including the last chunk line
    pub body: Vec<u8>,
    pub trailers: HeaderList,
    /// false for a message cut by a connection close
    pub complete: bool,
}

impl Message {
    pub fn request(method: impl Into<String>, uri: impl Into<String>) -> Message {
        Message {
            start: StartLine::Request {
                method: method.into(),
                uri: uri.into(),
            },
            version: Version::Http11,
            headers: HeaderList::new(),
            body: Vec::new(),
            trailers: HeaderList::new(),
            complete: true,
        }
    }

    pub fn response(status: u16) -> Message {
        Message {
            start: StartLine::Response {
                status,
                reason: Some(reason_phrase(status).to_owned()),
            },
            version: Version::Http11,
            headers: HeaderList::new(),
            body: Vec::new(),
            trailers: HeaderList::new(),
            complete: true,
        }
    }

    /// HTTP/2 request, the pseudo-headers are regular entries of the header
    /// list and can be altered like any other
    pub fn h2_request(method: &str, scheme: &str, authority: &str, path: &str) -> Message {
        let mut message = Message::request(method, path).version(Version::Http2);
        message.headers.add(":method", method);
        message.headers.add(":scheme", scheme);
        message.headers.add(":authority", authority);
        message.headers.add(":path", path);
        message
    }

    pub fn h2_response(status: u16) -> Message {
        let mut message = Message::response(status).version(Version::Http2);
        message.headers.add(":status", status.to_string());
        message
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn reason(mut self, reason: Option<&str>) -> Self {
        if let StartLine::Response { reason: current, .. } = &mut self.start {
            *current = reason.map(str::to_owned);
        }
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn headers<I, N, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        self.headers.extend(headers);
        self
    }

    /// `Host` for HTTP/1, `:authority` for HTTP/2
    pub fn authority(mut self, authority: &str) -> Self {
        match self.version {
            Version::Http2 => self.headers.set(":authority", authority),
            _ => self.headers.add("Host", authority),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Chunk encode `chunks` as the body and declare the coding
    pub fn chunked_body(mut self, chunks: &[&[u8]]) -> Self {
        let mut body = Vec::new();
        for chunk in chunks.iter().filter(|chunk| !chunk.is_empty()) {
            body.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            body.extend_from_slice(chunk);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"0\r\n");
        self.body = body;
        self.headers.set("Transfer-Encoding", "chunked");
        self
    }

    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.add(name, value);
        self
    }

    pub fn date(mut self, date: OffsetDateTime) -> Self {
        self.headers.set("Date", date::format_http_date(date));
        self
    }

    /// set `Content-Length` to the current body size
    pub fn with_content_length(mut self) -> Self {
        self.headers.set("Content-Length", self.body.len().to_string());
        self
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => reason.as_deref(),
            StartLine::Request { .. } => None,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.start = StartLine::Response {
            status,
            reason: Some(reason_phrase(status).to_owned()),
        };
        if self.headers.contains(":status") {
            self.headers.set(":status", status.to_string());
        }
    }

    /// the final transfer coding is chunked
    pub fn is_chunked(&self) -> bool {
        self.version != Version::Http2
            && self
                .headers
                .get_last("transfer-encoding")
                .and_then(|value| value.rsplit(',').next())
                .map_or(false, |coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// the payload without chunk framing
    pub fn decoded_body(&self) -> Vec<u8> {
        if self.is_chunked() {
            if let Some(body) = h1::decode_chunked(&self.body) {
                return body;
            }
        }
        self.body.clone()
    }

    /// Wire bytes for the declared version: text for HTTP/1.x (and unknown
    /// versions), a frame sequence on stream 1 with a fresh HPACK context for
    /// HTTP/2
    pub fn serialize(&self) -> Vec<u8> {
        match self.version {
            Version::Http2 => {
                let mut encoder = hpack::Encoder::new();
                h2::encode_message(self, 1, &mut encoder, frame::DEFAULT_MAX_FRAME_SIZE as usize)
                    .iter()
                    .flat_map(frame::Frame::serialize)
                    .collect()
            }
            _ => self.serialize_h1(),
        }
    }

    fn serialize_h1(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128 + self.body.len());
        match &self.start {
            StartLine::Request { method, uri } => {
                bytes.extend_from_slice(format!("{method} {uri} {}\r\n", self.version).as_bytes())
            }
            StartLine::Response { status, reason } => {
                bytes.extend_from_slice(format!("{} {status}", self.version).as_bytes());
                if let Some(reason) = reason {
                    bytes.push(b' ');
                    bytes.extend_from_slice(reason.as_bytes());
                }
                bytes.extend_from_slice(b"\r\n");
            }
        }
        bytes.extend_from_slice(self.headers.to_string().as_bytes());
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.body);
        if self.is_chunked() {
            bytes.extend_from_slice(self.trailers.to_string().as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            StartLine::Request { method, uri } => write!(f, "{method} {uri} {}", self.version)?,
            StartLine::Response { status, reason } => write!(
                f,
                "{} {status} {}",
                self.version,
                reason.as_deref().unwrap_or_default()
            )?,
        }
        write!(f, " ({} headers, {} body bytes)", self.headers.len(), self.body.len())
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let request = Message::request("GET", "/index.html")
            .authority("localhost")
            .header("Accept", "*/*");
        assert_eq!(
            request.serialize(),
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn serialize_invalid_response_verbatim() {
        let response = Message::response(200)
            .version(Version::Other("HTTP/9".to_owned()))
            .reason(None)
            .header("", "empty name")
            .header("Bad\x7fName", "x")
            .body("abc");
        assert_eq!(
            response.serialize(),
            b"HTTP/9 200\r\n: empty name\r\nBad\x7fName: x\r\n\r\nabc"
        );
    }

    #[test]
    fn chunked_with_trailers() {
        let response = Message::response(200)
            .chunked_body(&[b"1234", b"hello world"])
            .trailer("X-Checksum", "abc");
        assert!(response.is_chunked());
        assert_eq!(
            response.serialize(),
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n1234\r\nb\r\nhello world\r\n0\r\nX-Checksum: abc\r\n\r\n"
        );
        assert_eq!(response.decoded_body(), b"1234hello world");
    }

    #[test]
    fn h2_pseudo_headers_are_headers() {
        let mut request = Message::h2_request("GET", "https", "localhost", "/");
        request.headers.set(":path", "");
        assert_eq!(request.headers.get(":path"), Some(""));
        assert_eq!(request.headers.get(":method"), Some("GET"));

        let mut response = Message::h2_response(200);
        response.set_status(304);
        assert_eq!(response.headers.get(":status"), Some("304"));
        assert_eq!(response.reason_phrase(), Some("Not Modified"));
    }
}
