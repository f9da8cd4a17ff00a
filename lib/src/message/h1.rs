//! Incremental HTTP/1.x parser.
//!
//! Built on nom's streaming combinators: running out of input anywhere
//! yields [`Parsed::Incomplete`], so the caller simply appends the next
//! `recv()` to its buffer and tries again. Body framing follows RFC 9112
//! section 6.3.

use nom::{
    bytes::streaming::{tag, take, take_while, take_while1},
    character::streaming::{char, line_ending},
    combinator::opt,
    error::{Error, ErrorKind},
    sequence::preceded,
    Err, IResult,
};

use crate::message::{HeaderList, Message, Parsed, StartLine, Version};

/// Methods registered at IANA, plus `PURGE` and `UNKNOWN` used by cache and
/// rate limiting scenarios
pub const METHODS: &[&str] = &[
    "ACL",
    "BASELINE-CONTROL",
    "BIND",
    "CHECKIN",
    "CHECKOUT",
    "CONNECT",
    "COPY",
    "DELETE",
    "GET",
    "HEAD",
    "LABEL",
    "LINK",
    "LOCK",
    "MERGE",
    "MKACTIVITY",
    "MKCALENDAR",
    "MKCOL",
    "MKREDIRECTREF",
    "MKWORKSPACE",
    "MOVE",
    "OPTIONS",
    "ORDERPATCH",
    "PATCH",
    "POST",
    "PRI",
    "PROPFIND",
    "PROPPATCH",
    "PUT",
    "REBIND",
    "REPORT",
    "SEARCH",
    "TRACE",
    "UNBIND",
    "UNCHECKOUT",
    "UNLINK",
    "UNLOCK",
    "UPDATE",
    "UPDATEREDIRECTREF",
    "VERSION-CONTROL",
    "PURGE",
    "UNKNOWN",
];

fn is_tchar(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

fn not_line_end(c: u8) -> bool {
    c != b'\r' && c != b'\n'
}

fn is_ows(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = value {
        if !is_ows(*first) {
            break;
        }
        value = rest;
    }
    while let [rest @ .., last] = value {
        if !is_ows(*last) {
            break;
        }
        value = rest;
    }
    value
}

fn request_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (i, method) = take_while1(is_tchar)(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, uri) = take_while1(|c| c != b' ' && not_line_end(c))(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, version) = take_while1(|c| c != b' ' && not_line_end(c))(i)?;
    let (i, _) = line_ending(i)?;
    Ok((i, (method, uri, version)))
}

fn status_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8], Option<&[u8]>)> {
    let (i, version) = take_while1(|c| c != b' ' && not_line_end(c))(i)?;
    let (i, _) = char(' ')(i)?;
    let (i, status) = take_while1(|c: u8| c.is_ascii_digit())(i)?;
    let (i, reason) = opt(preceded(char(' '), take_while(not_line_end)))(i)?;
    let (i, _) = line_ending(i)?;
    Ok((i, (version, status, reason)))
}

fn header_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (i, name) = take_while(|c| c != b':' && not_line_end(c))(i)?;
    let (i, _) = char(':')(i)?;
    let (i, value) = take_while(not_line_end)(i)?;
    let (i, _) = line_ending(i)?;
    Ok((i, (name, value)))
}

/// Header fields up to and including the empty line. Obsolete line folding
/// is joined with a single space.
fn header_block(mut i: &[u8]) -> IResult<&[u8], HeaderList> {
    let mut headers = HeaderList::new();
    loop {
        match line_ending::<_, Error<&[u8]>>(i) {
            Ok((rest, _)) => return Ok((rest, headers)),
            Err(Err::Incomplete(needed)) => return Err(Err::Incomplete(needed)),
            Err(_) => {}
        }

        let (rest, (name, value)) = header_line(i)?;
        if name.is_empty() || !name.iter().all(|c| is_tchar(*c)) {
            return Err(Err::Failure(Error::new(i, ErrorKind::Verify)));
        }
        let mut value = lossy(trim_ows(value));
        i = rest;

        loop {
            match i.first() {
                None => return Err(Err::Incomplete(nom::Needed::new(1))),
                Some(c) if is_ows(*c) => {
                    let (rest, continuation) = take_while(not_line_end)(i)?;
                    let (rest, _) = line_ending(rest)?;
                    value.push(' ');
                    value.push_str(&lossy(trim_ows(continuation)));
                    i = rest;
                }
                Some(_) => break,
            }
        }
        headers.add(lossy(name), value);
    }
}

fn chunk_size_line(i: &[u8]) -> IResult<&[u8], usize> {
    let (rest, digits) = take_while1(|c: u8| c.is_ascii_hexdigit())(i)?;
    // chunk extensions are ignored
    let (rest, _) = take_while(not_line_end)(rest)?;
    let (rest, _) = line_ending(rest)?;
    let size = std::str::from_utf8(digits)
        .ok()
        .and_then(|digits| usize::from_str_radix(digits, 16).ok())
        .ok_or_else(|| Err::Failure(Error::new(i, ErrorKind::TooLarge)))?;
    Ok((rest, size))
}

/// Chunked body: the size of the raw chunks up to the last chunk line, and
/// the trailer section
fn chunked_body(input: &[u8]) -> IResult<&[u8], (usize, HeaderList)> {
    let mut i = input;
    loop {
        let (rest, size) = chunk_size_line(i)?;
        if size == 0 {
            let consumed = input.len() - rest.len();
            let (rest, trailers) = header_block(rest)?;
            return Ok((rest, (consumed, trailers)));
        }
        let (rest, _) = take(size)(rest)?;
        let (rest, _) = tag("\r\n")(rest)?;
        i = rest;
    }
}

/// Payload of a chunk encoded body, `None` if the framing is broken
pub fn decode_chunked(raw: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut i = raw;
    loop {
        let (rest, size) = chunk_size_line(i).ok()?;
        if size == 0 {
            return Some(body);
        }
        let (rest, data) = take::<_, _, Error<&[u8]>>(size)(rest).ok()?;
        let (rest, _) = tag::<_, _, Error<&[u8]>>("\r\n")(rest).ok()?;
        body.extend_from_slice(data);
        i = rest;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Sized(usize),
    Chunked,
    UntilClose,
}

fn content_length(headers: &HeaderList) -> Result<Option<usize>, String> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        for item in value.split(',').map(str::trim) {
            if item.is_empty() || !item.bytes().all(|c| c.is_ascii_digit()) {
                return Err(format!("invalid Content-Length '{value}'"));
            }
            let item: usize = item
                .parse()
                .map_err(|_| format!("Content-Length '{value}' is too large"))?;
            match length {
                Some(previous) if previous != item => {
                    return Err(format!("conflicting Content-Length values in '{value}'"))
                }
                _ => length = Some(item),
            }
        }
    }
    Ok(length)
}

fn final_coding_is_chunked(headers: &HeaderList) -> Option<bool> {
    let codings = headers.get_all("transfer-encoding");
    let last = codings.last()?;
    Some(
        last.rsplit(',')
            .next()
            .map_or(false, |coding| coding.trim().eq_ignore_ascii_case("chunked")),
    )
}

fn request_body(headers: &HeaderList) -> Result<BodyKind, String> {
    match final_coding_is_chunked(headers) {
        Some(true) => return Ok(BodyKind::Chunked),
        Some(false) => return Err("request transfer coding does not end with chunked".to_owned()),
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(length) => BodyKind::Sized(length),
        None => BodyKind::Empty,
    })
}

fn response_body(status: u16, head: bool, headers: &HeaderList) -> Result<BodyKind, String> {
    if head || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyKind::Empty);
    }
    match final_coding_is_chunked(headers) {
        Some(true) => return Ok(BodyKind::Chunked),
        Some(false) => return Ok(BodyKind::UntilClose),
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(length) => BodyKind::Sized(length),
        None => BodyKind::UntilClose,
    })
}

fn malformed<T>(what: &str, buf: &[u8], error: Err<Error<&[u8]>>) -> Parsed<T> {
    match error {
        Err::Incomplete(_) => Parsed::Incomplete,
        Err::Error(e) | Err::Failure(e) => {
            let offset = buf.len() - e.input.len();
            Parsed::Malformed(format!("invalid {what} at byte {offset} ({:?})", e.code))
        }
    }
}

/// Fill the body of `message` from `buf[offset..]`
fn read_body(
    mut message: Message,
    buf: &[u8],
    offset: usize,
    kind: BodyKind,
    at_eof: bool,
) -> Parsed<Message> {
    let rest = &buf[offset..];
    match kind {
        BodyKind::Empty => Parsed::Complete(message, offset),
        BodyKind::Sized(length) if rest.len() < length => Parsed::Incomplete,
        BodyKind::Sized(length) => {
            message.body = rest[..length].to_vec();
            Parsed::Complete(message, offset + length)
        }
        BodyKind::Chunked => match chunked_body(rest) {
            Ok((remaining, (raw, trailers))) => {
                message.body = rest[..raw].to_vec();
                message.trailers = trailers;
                Parsed::Complete(message, buf.len() - remaining.len())
            }
            Err(e) => malformed("chunked body", buf, e),
        },
        BodyKind::UntilClose if at_eof => {
            message.body = rest.to_vec();
            Parsed::Complete(message, buf.len())
        }
        BodyKind::UntilClose => Parsed::Incomplete,
    }
}

fn parse_version(version: &[u8]) -> Result<Version, String> {
    match version {
        b"HTTP/1.0" => Ok(Version::Http10),
        b"HTTP/1.1" => Ok(Version::Http11),
        other => Err(format!("unsupported version '{}'", lossy(other))),
    }
}

/// Parse one request from the start of `buf`. Empty lines before the
/// request line are skipped and counted in the consumed size.
pub fn parse_request(buf: &[u8]) -> Parsed<Message> {
    let mut offset = 0;
    loop {
        match &buf[offset..] {
            [b'\r', b'\n', ..] => offset += 2,
            [b'\n', ..] => offset += 1,
            [] | [b'\r'] => return Parsed::Incomplete,
            _ => break,
        }
    }

    let (rest, (method, uri, version)) = match request_line(&buf[offset..]) {
        Ok(parsed) => parsed,
        Err(e) => return malformed("request line", buf, e),
    };
    let method = lossy(method);
    if !METHODS.contains(&method.as_str()) {
        return Parsed::Malformed(format!("unknown method '{method}'"));
    }
    let version = match parse_version(version) {
        Ok(version) => version,
        Err(diagnostic) => return Parsed::Malformed(diagnostic),
    };

    let (rest, headers) = match header_block(rest) {
        Ok(parsed) => parsed,
        Err(e) => return malformed("header", buf, e),
    };
    let kind = match request_body(&headers) {
        Ok(kind) => kind,
        Err(diagnostic) => return Parsed::Malformed(diagnostic),
    };

    let message = Message {
        start: StartLine::Request {
            method,
            uri: lossy(uri),
        },
        version,
        headers,
        body: Vec::new(),
        trailers: HeaderList::new(),
        complete: true,
    };
    read_body(message, buf, buf.len() - rest.len(), kind, false)
}

/// Response framing depends on the request, a response to `HEAD` has no body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseParser {
    pub head: bool,
}

impl ResponseParser {
    pub fn new(head: bool) -> Self {
        ResponseParser { head }
    }

    pub fn parse(&self, buf: &[u8]) -> Parsed<Message> {
        self.parse_inner(buf, false)
    }

    /// The connection is closed: a body delimited by the close is complete,
    /// any other partial message is malformed
    pub fn parse_at_eof(&self, buf: &[u8]) -> Parsed<Message> {
        if buf.is_empty() {
            return Parsed::Incomplete;
        }
        match self.parse_inner(buf, true) {
            Parsed::Incomplete => Parsed::Malformed(format!(
                "connection closed after {} bytes of an unfinished response",
                buf.len()
            )),
            parsed => parsed,
        }
    }

    fn parse_inner(&self, buf: &[u8], at_eof: bool) -> Parsed<Message> {
        let (rest, (version, status, reason)) = match status_line(buf) {
            Ok(parsed) => parsed,
            Err(e) => return malformed("status line", buf, e),
        };
        let version = match parse_version(version) {
            Ok(version) => version,
            Err(diagnostic) => return Parsed::Malformed(diagnostic),
        };
        let status = match std::str::from_utf8(status).ok().and_then(|s| s.parse::<u16>().ok()) {
            Some(status) if status.to_string().len() == 3 && (100..=599).contains(&status) => {
                status
            }
            _ => return Parsed::Malformed(format!("invalid status code '{}'", lossy(status))),
        };

        let (rest, headers) = match header_block(rest) {
            Ok(parsed) => parsed,
            Err(e) => return malformed("header", buf, e),
        };
        let kind = match response_body(status, self.head, &headers) {
            Ok(kind) => kind,
            Err(diagnostic) => return Parsed::Malformed(diagnostic),
        };

        let message = Message {
            start: StartLine::Response {
                status,
                reason: reason.map(lossy),
            },
            version,
            headers,
            body: Vec::new(),
            trailers: HeaderList::new(),
            complete: true,
        };
        read_body(message, buf, buf.len() - rest.len(), kind, at_eof)
    }
}

pub fn parse_response(buf: &[u8], head: bool) -> Parsed<Message> {
    ResponseParser::new(head).parse(buf)
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    #[test]
    fn request_incrementally() {
        let raw = b"\r\nGET /index.html HTTP/1.1\r\nHost: localhost\r\nX-Folded: a\r\n  b\r\n\r\n";
        for end in 0..raw.len() {
            assert_eq!(parse_request(&raw[..end]), Parsed::Incomplete, "at {end}");
        }
        match parse_request(raw) {
            Parsed::Complete(request, consumed) => {
                assert_eq!(consumed, raw.len());
                assert_eq!(request.method(), Some("GET"));
                assert_eq!(request.uri(), Some("/index.html"));
                assert_eq!(request.headers.get("x-folded"), Some("a b"));
                assert!(request.body.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pipelined_requests() {
        let raw = b"GET /1 HTTP/1.1\r\n\r\nPOST /2 HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET";
        let Parsed::Complete(first, consumed) = parse_request(raw) else {
            panic!("first request")
        };
        assert_eq!(first.uri(), Some("/1"));
        let Parsed::Complete(second, used) = parse_request(&raw[consumed..]) else {
            panic!("second request")
        };
        assert_eq!(second.body, b"abc");
        assert_eq!(parse_request(&raw[consumed + used..]), Parsed::Incomplete);
    }

    #[test]
    fn malformed_requests() {
        for raw in [
            &b"FOO / HTTP/1.1\r\n\r\n"[..],
            b"GET / HTTP/3.0\r\n\r\n",
            b"GET /\r\n\r\n",
            b"GET / HTTP/1.1\r\n: empty\r\n\r\n",
            b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: 1, 2\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
        ] {
            assert!(
                matches!(parse_request(raw), Parsed::Malformed(_)),
                "{:?} should be malformed",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn chunked_request_with_trailers() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\n1234\r\n0\r\nX-Sum: 10\r\n\r\n";
        let Parsed::Complete(request, consumed) = parse_request(raw) else {
            panic!("chunked request")
        };
        assert_eq!(consumed, raw.len());
        assert_eq!(request.body, b"4;ext=1\r\n1234\r\n0\r\n");
        assert_eq!(request.decoded_body(), b"1234");
        assert_eq!(request.trailers.get("x-sum"), Some("10"));
        assert_eq!(request.serialize(), raw.to_vec());
    }

    #[test]
    fn response_framing() {
        let parser = ResponseParser::new(false);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(parser.parse(&raw[..raw.len() - 1]), Parsed::Incomplete);
        assert!(matches!(parser.parse(raw), Parsed::Complete(_, size) if size == raw.len()));

        // no body for HEAD, whatever Content-Length says
        let head = ResponseParser::new(true);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        assert!(
            matches!(head.parse(raw), Parsed::Complete(ref m, size) if size == raw.len() && m.body.is_empty())
        );

        let raw = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 5\r\n\r\n";
        assert!(matches!(parser.parse(raw), Parsed::Complete(ref m, _) if m.body.is_empty()));
    }

    #[test]
    fn response_until_close() {
        let parser = ResponseParser::default();
        let raw = b"HTTP/1.0 200 OK\r\n\r\nbody until close";
        assert_eq!(parser.parse(raw), Parsed::Incomplete);
        let Parsed::Complete(response, consumed) = parser.parse_at_eof(raw) else {
            panic!("body until close")
        };
        assert_eq!(consumed, raw.len());
        assert_eq!(response.body, b"body until close");

        assert!(matches!(
            parser.parse_at_eof(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort"),
            Parsed::Malformed(_)
        ));
    }

    #[test]
    fn status_line_variants() {
        let parser = ResponseParser::default();
        let Parsed::Complete(response, _) = parser.parse(b"HTTP/1.1 200\r\nContent-Length: 0\r\n\r\n")
        else {
            panic!("status without reason")
        };
        assert_eq!(response.reason_phrase(), None);
        assert_eq!(
            response.serialize(),
            b"HTTP/1.1 200\r\nContent-Length: 0\r\n\r\n".to_vec()
        );

        for raw in [
            &b"HTTP/1.1 99 Too Low\r\n\r\n"[..],
            b"HTTP/1.1 600 Too High\r\n\r\n",
            b"HTTP/1.1 2000 OK\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"ICY 200 OK\r\n\r\n",
        ] {
            assert!(matches!(parser.parse(raw), Parsed::Malformed(_)));
        }
    }

    #[derive(Debug, Clone)]
    struct ValidMessage(Message);

    fn alphanumeric(g: &mut Gen, min: usize) -> String {
        let alphabet: Vec<char> = ('a'..='z').chain('A'..='Z').chain('0'..='9').collect();
        let length = min + usize::arbitrary(g) % 12;
        (0..length)
            .map(|_| *g.choose(&alphabet).unwrap_or(&'a'))
            .collect()
    }

    impl Arbitrary for ValidMessage {
        fn arbitrary(g: &mut Gen) -> Self {
            let mut message = if bool::arbitrary(g) {
                let method = *g.choose(&["GET", "POST", "PUT", "PURGE", "DELETE"]).unwrap_or(&"GET");
                Message::request(method, format!("/{}", alphanumeric(g, 0)))
            } else {
                Message::response(*g.choose(&[200, 201, 404, 500, 502]).unwrap_or(&200))
            };
            for _ in 0..usize::arbitrary(g) % 6 {
                let name = format!("X-{}", alphanumeric(g, 1));
                let value = alphanumeric(g, 0);
                message.headers.add(name, value);
            }
            let body: Vec<u8> = Vec::arbitrary(g);
            message.body(body).with_content_length().into()
        }
    }

    impl From<Message> for ValidMessage {
        fn from(message: Message) -> Self {
            ValidMessage(message)
        }
    }

    #[test]
    fn serialize_parse_round_trip() {
        fn round_trip(message: ValidMessage) -> bool {
            let message = message.0;
            let bytes = message.serialize();
            let parsed = if message.is_request() {
                parse_request(&bytes)
            } else {
                parse_response(&bytes, false)
            };
            parsed == Parsed::Complete(message, bytes.len())
        }
        QuickCheck::new()
            .tests(200)
            .quickcheck(round_trip as fn(ValidMessage) -> bool);
    }
}
