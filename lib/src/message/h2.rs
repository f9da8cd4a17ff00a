//! HTTP/2 rendering and reassembly.
//!
//! Messages become HEADERS (+CONTINUATION), DATA and trailing HEADERS
//! frames. Header blocks are HPACK encoded as they are, pseudo-headers
//! included, without any check: an empty `:path` or an uppercase name is
//! sent like anything else.

use std::collections::HashMap;

use hpack::{Decoder, Encoder};

use crate::message::{
    frame::{self, flags, Frame, FrameType},
    HeaderList, Message, Parsed, StartLine, Version,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum H2Error {
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("could not decode the header block of stream {stream_id}: {message}")]
    Hpack { stream_id: u32, message: String },
    #[error("expected a CONTINUATION for stream {expected}, got {kind:?} on stream {stream_id}")]
    ContinuationExpected {
        expected: u32,
        kind: FrameType,
        stream_id: u32,
    },
    #[error("stream {0} has neither :status nor :method")]
    MissingPseudoHeader(u32),
    #[error("invalid :status '{status}' on stream {stream_id}")]
    InvalidStatus { stream_id: u32, status: String },
    #[error("invalid padding on stream {0}")]
    Padding(u32),
}

/// Render `message` as frames on `stream_id`. The block is split in
/// CONTINUATION frames and the body in DATA frames at `max_frame_size`.
pub fn encode_message(
    message: &Message,
    stream_id: u32,
    encoder: &mut Encoder<'_>,
    max_frame_size: usize,
) -> Vec<Frame> {
    let max_frame_size = max_frame_size.max(1);
    let has_body = !message.body.is_empty();
    let has_trailers = !message.trailers.is_empty();
    let mut frames = Vec::new();

    let block = encode_block(&message.headers, encoder);
    push_header_block(&mut frames, stream_id, &block, !has_body && !has_trailers, max_frame_size);

    if has_body {
        let mut chunks = message.body.chunks(max_frame_size).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            frames.push(Frame::data(stream_id, chunk, last && !has_trailers));
        }
    }

    if has_trailers {
        let block = encode_block(&message.trailers, encoder);
        push_header_block(&mut frames, stream_id, &block, true, max_frame_size);
    }
    frames
}

fn encode_block(headers: &HeaderList, encoder: &mut Encoder<'_>) -> Vec<u8> {
    encoder.encode(
        headers
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
    )
}

fn push_header_block(
    frames: &mut Vec<Frame>,
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) {
    let mut fragments = block.chunks(max_frame_size);
    let first = fragments.next().unwrap_or_default();
    let mut rest = fragments.peekable();
    frames.push(Frame::headers(stream_id, first, end_stream, rest.peek().is_none()));
    while let Some(fragment) = rest.next() {
        frames.push(Frame::continuation(stream_id, fragment, rest.peek().is_none()));
    }
}

/// What the peer sent, besides the control answers queued automatically
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H2Event {
    Message { stream_id: u32, message: Message },
    Settings(Vec<(u16, u32)>),
    SettingsAck,
    Ping([u8; 8]),
    PingAck([u8; 8]),
    Reset { stream_id: u32, error_code: u32 },
    GoAway { last_stream_id: u32, error_code: u32 },
    WindowUpdate { stream_id: u32, increment: u32 },
}

#[derive(Debug, Default)]
struct StreamState {
    headers: Option<HeaderList>,
    body: Vec<u8>,
    trailers: HeaderList,
}

/// An open header block, waiting for its CONTINUATION frames
struct HeaderBlock {
    stream_id: u32,
    block: Vec<u8>,
    end_stream: bool,
}

/// One side of an HTTP/2 connection: HPACK contexts, reassembly of
/// streams, and the automatic answers to SETTINGS, PING and DATA
pub struct H2Connection {
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
    buffer: Vec<u8>,
    streams: HashMap<u32, StreamState>,
    header_block: Option<HeaderBlock>,
    /// largest frame accepted from the peer
    pub max_frame_size: u32,
    /// largest frame the peer accepts
    pub peer_max_frame_size: u32,
    next_stream_id: u32,
    output: Vec<u8>,
}

impl Default for H2Connection {
    fn default() -> Self {
        H2Connection::new()
    }
}

impl H2Connection {
    pub fn new() -> Self {
        H2Connection {
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buffer: Vec::new(),
            streams: HashMap::new(),
            header_block: None,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            peer_max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            next_stream_id: 1,
            output: Vec::new(),
        }
    }

    /// connection preface followed by our SETTINGS
    pub fn client_preface(parameters: &[(u16, u32)]) -> Vec<u8> {
        let mut bytes = frame::CLIENT_PREFACE.to_vec();
        bytes.extend(Frame::settings(parameters).serialize());
        bytes
    }

    /// next client initiated stream: 1, 3, 5...
    pub fn next_stream_id(&mut self) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        stream_id
    }

    pub fn encode(&mut self, message: &Message, stream_id: u32) -> Vec<u8> {
        encode_message(
            message,
            stream_id,
            &mut self.encoder,
            self.peer_max_frame_size as usize,
        )
        .iter()
        .flat_map(Frame::serialize)
        .collect()
    }

    /// control frames to send back: SETTINGS and PING acks, WINDOW_UPDATE
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// streams with a partially received message
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Feed received bytes, returns the events of every complete frame
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<H2Event>, H2Error> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut offset = 0;
        loop {
            match frame::parse_frame(&self.buffer[offset..], self.max_frame_size) {
                Parsed::Complete(frame, size) => {
                    offset += size;
                    trace!("H2\treceived {:?} on stream {}", frame.kind, frame.stream_id);
                    if let Some(event) = self.process(frame)? {
                        events.push(event);
                    }
                }
                Parsed::Incomplete => break,
                Parsed::Malformed(diagnostic) => return Err(H2Error::Frame(diagnostic)),
            }
        }
        self.buffer.drain(..offset);
        Ok(events)
    }

    fn process(&mut self, frame: Frame) -> Result<Option<H2Event>, H2Error> {
        if let Some(open) = &self.header_block {
            if frame.kind != FrameType::Continuation || frame.stream_id != open.stream_id {
                return Err(H2Error::ContinuationExpected {
                    expected: open.stream_id,
                    kind: frame.kind,
                    stream_id: frame.stream_id,
                });
            }
        }

        match frame.kind {
            FrameType::Headers => {
                let mut payload = strip_padding(&frame)?;
                if frame.has_flag(flags::PRIORITY) {
                    payload = payload.get(5..).ok_or(H2Error::Padding(frame.stream_id))?;
                }
                let block = HeaderBlock {
                    stream_id: frame.stream_id,
                    block: payload.to_vec(),
                    end_stream: frame.has_flag(flags::END_STREAM),
                };
                if frame.has_flag(flags::END_HEADERS) {
                    self.finish_header_block(block)
                } else {
                    self.header_block = Some(block);
                    Ok(None)
                }
            }
            FrameType::Continuation => {
                let mut block = match self.header_block.take() {
                    Some(block) => block,
                    None => {
                        return Err(H2Error::Frame(format!(
                            "CONTINUATION without HEADERS on stream {}",
                            frame.stream_id
                        )))
                    }
                };
                block.block.extend_from_slice(&frame.payload);
                if frame.has_flag(flags::END_HEADERS) {
                    self.finish_header_block(block)
                } else {
                    self.header_block = Some(block);
                    Ok(None)
                }
            }
            FrameType::Data => {
                let data = strip_padding(&frame)?.to_vec();
                if !frame.payload.is_empty() {
                    let increment = frame.payload.len() as u32;
                    self.output
                        .extend(Frame::window_update(0, increment).serialize());
                    self.output
                        .extend(Frame::window_update(frame.stream_id, increment).serialize());
                }
                self.streams
                    .entry(frame.stream_id)
                    .or_default()
                    .body
                    .extend(data);
                if frame.has_flag(flags::END_STREAM) {
                    self.complete_stream(frame.stream_id).map(Some)
                } else {
                    Ok(None)
                }
            }
            FrameType::Settings if frame.has_flag(flags::ACK) => Ok(Some(H2Event::SettingsAck)),
            FrameType::Settings => {
                let parameters = frame.settings_parameters().ok_or_else(|| {
                    H2Error::Frame(format!("SETTINGS of {} bytes", frame.payload.len()))
                })?;
                for (identifier, value) in &parameters {
                    if *identifier == frame::settings::MAX_FRAME_SIZE {
                        self.peer_max_frame_size = *value;
                    }
                }
                self.output.extend(Frame::settings_ack().serialize());
                Ok(Some(H2Event::Settings(parameters)))
            }
            FrameType::Ping => {
                let data: [u8; 8] = frame
                    .payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| H2Error::Frame(format!("PING of {} bytes", frame.payload.len())))?;
                if frame.has_flag(flags::ACK) {
                    Ok(Some(H2Event::PingAck(data)))
                } else {
                    self.output.extend(Frame::ping(data, true).serialize());
                    Ok(Some(H2Event::Ping(data)))
                }
            }
            FrameType::RstStream => {
                self.streams.remove(&frame.stream_id);
                Ok(Some(H2Event::Reset {
                    stream_id: frame.stream_id,
                    error_code: frame.error_code().unwrap_or_default(),
                }))
            }
            FrameType::GoAway => {
                let last_stream_id = frame
                    .payload
                    .get(..4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) & 0x7fff_ffff)
                    .unwrap_or_default();
                Ok(Some(H2Event::GoAway {
                    last_stream_id,
                    error_code: frame.error_code().unwrap_or_default(),
                }))
            }
            FrameType::WindowUpdate => {
                let increment = frame
                    .payload
                    .get(..4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) & 0x7fff_ffff)
                    .unwrap_or_default();
                Ok(Some(H2Event::WindowUpdate {
                    stream_id: frame.stream_id,
                    increment,
                }))
            }
            FrameType::Priority | FrameType::PushPromise | FrameType::Unknown(_) => {
                debug!("H2\tignoring {:?} frame on stream {}", frame.kind, frame.stream_id);
                Ok(None)
            }
        }
    }

    fn finish_header_block(&mut self, block: HeaderBlock) -> Result<Option<H2Event>, H2Error> {
        let stream_id = block.stream_id;
        check_size_updates(&block.block)
            .map_err(|message| H2Error::Hpack { stream_id, message })?;
        let fields = self
            .decoder
            .decode(&block.block)
            .map_err(|e| H2Error::Hpack {
                stream_id,
                message: format!("{e:?}"),
            })?;
        let list: HeaderList = fields
            .iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(name).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                )
            })
            .collect();

        let stream = self.streams.entry(stream_id).or_default();
        match &stream.headers {
            // an informational response is replaced by the final one
            Some(headers) if is_informational(headers) => stream.headers = Some(list),
            Some(_) => stream.trailers = list,
            None => stream.headers = Some(list),
        }

        if block.end_stream {
            self.complete_stream(stream_id).map(Some)
        } else {
            Ok(None)
        }
    }

    fn complete_stream(&mut self, stream_id: u32) -> Result<H2Event, H2Error> {
        let stream = self.streams.remove(&stream_id).unwrap_or_default();
        let headers = stream.headers.unwrap_or_default();

        let start = if let Some(status) = headers.get(":status") {
            let code = status
                .parse::<u16>()
                .ok()
                .filter(|code| (100..=599).contains(code))
                .ok_or_else(|| H2Error::InvalidStatus {
                    stream_id,
                    status: status.to_owned(),
                })?;
            StartLine::Response {
                status: code,
                reason: Some(crate::message::reason_phrase(code).to_owned()),
            }
        } else if let Some(method) = headers.get(":method") {
            StartLine::Request {
                method: method.to_owned(),
                uri: headers.get(":path").unwrap_or_default().to_owned(),
            }
        } else {
            return Err(H2Error::MissingPseudoHeader(stream_id));
        };

        Ok(H2Event::Message {
            stream_id,
            message: Message {
                start,
                version: Version::Http2,
                headers,
                body: stream.body,
                trailers: stream.trailers,
                complete: true,
            },
        })
    }
}

/// SETTINGS_HEADER_TABLE_SIZE we accept, never changed from the default
const HEADER_TABLE_SIZE: usize = 4096;

/// HPACK integer with an N-bit prefix, limited to 5 octets like the decoder.
/// Returns the value and the octets used.
fn hpack_integer(buf: &[u8], prefix: u8) -> Result<(usize, usize), String> {
    let mask = (1u8 << prefix) - 1;
    let first = *buf.first().ok_or("truncated integer")?;
    let mut value = usize::from(first & mask);
    if value < usize::from(mask) {
        return Ok((value, 1));
    }
    for (index, byte) in buf.iter().enumerate().skip(1).take(4) {
        value += usize::from(byte & 0x7f) << (7 * (index - 1));
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
    }
    if buf.len() > 5 {
        Err("integer overflow".to_owned())
    } else {
        Err("truncated integer".to_owned())
    }
}

fn hpack_string(buf: &[u8]) -> Result<usize, String> {
    let (length, used) = hpack_integer(buf, 7)?;
    let size = used.saturating_add(length);
    if size > buf.len() {
        return Err("truncated string literal".to_owned());
    }
    Ok(size)
}

/// Walk the representations of a header block and validate its dynamic table
/// size updates, the hpack decoder panics on an oversized one.
fn check_size_updates(block: &[u8]) -> Result<(), String> {
    let mut offset = 0;
    let mut seen_field = false;
    while let Some(&first) = block.get(offset) {
        let (prefix, literal) = if first & 0x80 != 0 {
            (7, false)
        } else if first & 0xc0 == 0x40 {
            (6, true)
        } else if first & 0xe0 == 0x20 {
            if seen_field {
                return Err("dynamic table size update after a header field".to_owned());
            }
            let (size, used) = hpack_integer(&block[offset..], 5)?;
            if size > HEADER_TABLE_SIZE {
                return Err(format!(
                    "dynamic table size update to {size} above {HEADER_TABLE_SIZE}"
                ));
            }
            offset += used;
            continue;
        } else {
            (4, true)
        };

        let (index, used) = hpack_integer(&block[offset..], prefix)?;
        offset += used;
        seen_field = true;
        if literal {
            if index == 0 {
                offset += hpack_string(&block[offset..])?;
            }
            offset += hpack_string(&block[offset..])?;
        }
    }
    Ok(())
}

fn is_informational(headers: &HeaderList) -> bool {
    headers
        .get(":status")
        .map_or(false, |status| status.starts_with('1'))
}

fn strip_padding(frame: &Frame) -> Result<&[u8], H2Error> {
    if !frame.has_flag(flags::PADDED) {
        return Ok(&frame.payload);
    }
    let (pad_length, rest) = frame
        .payload
        .split_first()
        .ok_or(H2Error::Padding(frame.stream_id))?;
    let end = rest
        .len()
        .checked_sub(usize::from(*pad_length))
        .ok_or(H2Error::Padding(frame.stream_id))?;
    Ok(&rest[..end])
}

/// Parse a message from a self-contained frame sequence, HTTP/2 counterpart
/// of the HTTP/1 parsers
pub fn parse_message(buf: &[u8]) -> Parsed<Message> {
    let mut connection = H2Connection::new();
    let mut offset = 0;
    loop {
        match frame::parse_frame(&buf[offset..], connection.max_frame_size) {
            Parsed::Complete(frame, size) => {
                offset += size;
                match connection.process(frame) {
                    Ok(Some(H2Event::Message { message, .. })) => {
                        return Parsed::Complete(message, offset)
                    }
                    Ok(_) => {}
                    Err(e) => return Parsed::Malformed(e.to_string()),
                }
            }
            Parsed::Incomplete => return Parsed::Incomplete,
            Parsed::Malformed(diagnostic) => return Parsed::Malformed(diagnostic),
        }
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    #[test]
    fn request_round_trip() {
        let request = Message::h2_request("POST", "https", "localhost", "/upload")
            .header("content-type", "text/plain")
            .body("some body")
            .trailer("x-checksum", "42");
        let bytes = request.serialize();
        assert_eq!(parse_message(&bytes), Parsed::Complete(request, bytes.len()));
        assert_eq!(parse_message(&bytes[..bytes.len() - 1]), Parsed::Incomplete);
    }

    #[test]
    fn headers_split_in_continuations() {
        let mut encoder = Encoder::new();
        let response = Message::h2_response(200).header("x-long", "a".repeat(100));
        let frames = encode_message(&response, 1, &mut encoder, 16);
        assert_eq!(frames[0].kind, FrameType::Headers);
        assert!(frames[0].has_flag(flags::END_STREAM));
        assert!(!frames[0].has_flag(flags::END_HEADERS));
        assert!(frames[1..]
            .iter()
            .all(|frame| frame.kind == FrameType::Continuation));
        assert!(frames.last().unwrap().has_flag(flags::END_HEADERS));

        let mut connection = H2Connection::new();
        let bytes: Vec<u8> = frames.iter().flat_map(Frame::serialize).collect();
        let events = connection.receive(&bytes).unwrap();
        assert!(matches!(
            &events[..],
            [H2Event::Message { stream_id: 1, message }] if *message == response
        ));
    }

    #[test]
    fn control_frames_are_answered() {
        let mut connection = H2Connection::new();
        let mut bytes = Frame::settings(&[(frame::settings::MAX_FRAME_SIZE, 32_768)]).serialize();
        bytes.extend(Frame::ping(*b"12345678", false).serialize());
        let events = connection.receive(&bytes).unwrap();
        assert_eq!(
            events,
            vec![
                H2Event::Settings(vec![(frame::settings::MAX_FRAME_SIZE, 32_768)]),
                H2Event::Ping(*b"12345678"),
            ]
        );
        assert_eq!(connection.peer_max_frame_size, 32_768);

        let mut expected = Frame::settings_ack().serialize();
        expected.extend(Frame::ping(*b"12345678", true).serialize());
        assert_eq!(connection.take_output(), expected);
        assert!(connection.take_output().is_empty());
    }

    #[test]
    fn interleaved_frame_during_header_block() {
        let mut connection = H2Connection::new();
        let mut bytes = Frame::headers(1, b"", false, false).serialize();
        bytes.extend(Frame::data(1, b"x", true).serialize());
        assert!(matches!(
            connection.receive(&bytes),
            Err(H2Error::ContinuationExpected { .. })
        ));
    }

    #[test]
    fn invalid_status() {
        let mut response = Message::h2_response(200);
        response.headers.set(":status", "2000");
        assert!(matches!(
            parse_message(&response.serialize()),
            Parsed::Malformed(_)
        ));
    }

    #[test]
    fn oversized_table_size_update() {
        let overflowing: [&[u8]; 3] = [
            &[0x3f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0f],
            &[0x3f, 0xff, 0xff, 0xff, 0xff, 0x7f],
            &[0x3f, 0xff, 0xff],
        ];
        for block in overflowing {
            let bytes = Frame::headers(1, block, true, true).serialize();
            assert!(
                matches!(parse_message(&bytes), Parsed::Malformed(_)),
                "{block:x?}"
            );
        }

        // within the 5 octet limit but above the table size we advertise
        let bytes = Frame::headers(1, &[0x3f, 0xe2, 0x1f], true, true).serialize();
        assert!(matches!(parse_message(&bytes), Parsed::Malformed(_)));

        let mut connection = H2Connection::new();
        let block = [0x3f, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let bytes = Frame::headers(3, &block, true, true).serialize();
        assert!(matches!(
            connection.receive(&bytes),
            Err(H2Error::Hpack { stream_id: 3, .. })
        ));
    }

    #[test]
    fn table_size_update_placement() {
        // size update to 0 then :status 200 from the static table
        let bytes = Frame::headers(1, &[0x20, 0x88], true, true).serialize();
        assert!(matches!(
            parse_message(&bytes),
            Parsed::Complete(message, _) if message.status() == Some(200)
        ));

        let bytes = Frame::headers(1, &[0x88, 0x20], true, true).serialize();
        assert!(matches!(parse_message(&bytes), Parsed::Malformed(_)));
    }

    #[derive(Debug, Clone)]
    struct H2Message(Message);

    impl Arbitrary for H2Message {
        fn arbitrary(g: &mut Gen) -> Self {
            let token = |g: &mut Gen| -> String {
                let alphabet: Vec<char> = ('a'..='z').chain('0'..='9').collect();
                (0..1 + usize::arbitrary(g) % 10)
                    .map(|_| *g.choose(&alphabet).unwrap_or(&'a'))
                    .collect()
            };
            let mut message = if bool::arbitrary(g) {
                let path = format!("/{}", token(g));
                Message::h2_request("GET", "https", "localhost", &path)
            } else {
                Message::h2_response(*g.choose(&[200, 204, 404, 503]).unwrap_or(&200))
            };
            for _ in 0..usize::arbitrary(g) % 5 {
                let name = format!("x-{}", token(g));
                let value = token(g);
                message.headers.add(name, value);
            }
            message.body = Vec::arbitrary(g);
            H2Message(message)
        }
    }

    #[test]
    fn serialize_parse_round_trip() {
        fn round_trip(message: H2Message) -> bool {
            let bytes = message.0.serialize();
            parse_message(&bytes) == Parsed::Complete(message.0, bytes.len())
        }
        QuickCheck::new()
            .tests(100)
            .quickcheck(round_trip as fn(H2Message) -> bool);
    }
}
