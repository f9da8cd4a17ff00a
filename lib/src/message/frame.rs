use nom::{
    bytes::streaming::take,
    number::streaming::{be_u24, be_u32, be_u8},
    Err, IResult,
};

use crate::message::Parsed;

pub const FRAME_HEADER_SIZE: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// error codes of RST_STREAM and GOAWAY
pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const INTERNAL_ERROR: u32 = 0x2;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const STREAM_CLOSED: u32 = 0x5;
    pub const FRAME_SIZE_ERROR: u32 = 0x6;
    pub const REFUSED_STREAM: u32 = 0x7;
    pub const CANCEL: u32 = 0x8;
    pub const COMPRESSION_ERROR: u32 = 0x9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            0 => FrameType::Data,
            1 => FrameType::Headers,
            2 => FrameType::Priority,
            3 => FrameType::RstStream,
            4 => FrameType::Settings,
            5 => FrameType::PushPromise,
            6 => FrameType::Ping,
            7 => FrameType::GoAway,
            8 => FrameType::WindowUpdate,
            9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(kind: FrameType) -> Self {
        match kind {
            FrameType::Data => 0,
            FrameType::Headers => 1,
            FrameType::Priority => 2,
            FrameType::RstStream => 3,
            FrameType::Settings => 4,
            FrameType::PushPromise => 5,
            FrameType::Ping => 6,
            FrameType::GoAway => 7,
            FrameType::WindowUpdate => 8,
            FrameType::Continuation => 9,
            FrameType::Unknown(other) => other,
        }
    }
}

/// One HTTP/2 frame. Constructors build valid frames, but every field is
/// public and [`Frame::raw`] accepts anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn raw(kind: u8, flags: u8, stream_id: u32, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameType::from(kind),
            flags,
            stream_id,
            payload,
        }
    }

    pub fn settings(parameters: &[(u16, u32)]) -> Frame {
        let mut payload = Vec::with_capacity(parameters.len() * 6);
        for (identifier, value) in parameters {
            payload.extend_from_slice(&identifier.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Frame {
            kind: FrameType::Settings,
            flags: 0,
            stream_id: 0,
            payload,
        }
    }

    pub fn settings_ack() -> Frame {
        Frame {
            kind: FrameType::Settings,
            flags: flags::ACK,
            stream_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn ping(data: [u8; 8], ack: bool) -> Frame {
        Frame {
            kind: FrameType::Ping,
            flags: if ack { flags::ACK } else { 0 },
            stream_id: 0,
            payload: data.to_vec(),
        }
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Frame {
        Frame {
            kind: FrameType::WindowUpdate,
            flags: 0,
            stream_id,
            payload: (increment & 0x7fff_ffff).to_be_bytes().to_vec(),
        }
    }

    pub fn rst_stream(stream_id: u32, error_code: u32) -> Frame {
        Frame {
            kind: FrameType::RstStream,
            flags: 0,
            stream_id,
            payload: error_code.to_be_bytes().to_vec(),
        }
    }

    pub fn goaway(last_stream_id: u32, error_code: u32, debug_data: &[u8]) -> Frame {
        let mut payload = Vec::with_capacity(8 + debug_data.len());
        payload.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
        payload.extend_from_slice(&error_code.to_be_bytes());
        payload.extend_from_slice(debug_data);
        Frame {
            kind: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
            payload,
        }
    }

    pub fn data(stream_id: u32, data: &[u8], end_stream: bool) -> Frame {
        Frame {
            kind: FrameType::Data,
            flags: if end_stream { flags::END_STREAM } else { 0 },
            stream_id,
            payload: data.to_vec(),
        }
    }

    pub fn headers(stream_id: u32, block: &[u8], end_stream: bool, end_headers: bool) -> Frame {
        let mut flags = 0;
        if end_stream {
            flags |= flags::END_STREAM;
        }
        if end_headers {
            flags |= flags::END_HEADERS;
        }
        Frame {
            kind: FrameType::Headers,
            flags,
            stream_id,
            payload: block.to_vec(),
        }
    }

    pub fn continuation(stream_id: u32, block: &[u8], end_headers: bool) -> Frame {
        Frame {
            kind: FrameType::Continuation,
            flags: if end_headers { flags::END_HEADERS } else { 0 },
            stream_id,
            payload: block.to_vec(),
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Header and payload. The length field always reflects the payload,
    /// truncated to 24 bits.
    pub fn serialize(&self) -> Vec<u8> {
        let length = (self.payload.len() as u32).min(0x00ff_ffff);
        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&length.to_be_bytes()[1..]);
        bytes.push(u8::from(self.kind));
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.stream_id.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// SETTINGS parameters, `None` if the payload is not a multiple of 6
    pub fn settings_parameters(&self) -> Option<Vec<(u16, u32)>> {
        if self.payload.len() % 6 != 0 {
            return None;
        }
        Some(
            self.payload
                .chunks_exact(6)
                .map(|chunk| {
                    (
                        u16::from_be_bytes([chunk[0], chunk[1]]),
                        u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                    )
                })
                .collect(),
        )
    }

    /// the four bytes of a RST_STREAM, or the error code of a GOAWAY
    pub fn error_code(&self) -> Option<u32> {
        let bytes = match self.kind {
            FrameType::RstStream => self.payload.get(..4)?,
            FrameType::GoAway => self.payload.get(4..8)?,
            _ => return None,
        };
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub kind: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

pub fn frame_header(i: &[u8]) -> IResult<&[u8], FrameHeader> {
    let (i, payload_len) = be_u24(i)?;
    let (i, kind) = be_u8(i)?;
    let (i, flags) = be_u8(i)?;
    let (i, stream_id) = be_u32(i)?;
    Ok((
        i,
        FrameHeader {
            payload_len,
            kind: FrameType::from(kind),
            flags,
            // the reserved bit is ignored on reception
            stream_id: stream_id & 0x7fff_ffff,
        },
    ))
}

fn frame(i: &[u8]) -> IResult<&[u8], (FrameHeader, &[u8])> {
    let (i, header) = frame_header(i)?;
    let (i, payload) = take(header.payload_len)(i)?;
    Ok((i, (header, payload)))
}

/// Parse one frame from the start of `buf`, refusing payloads larger than
/// `max_frame_size`
pub fn parse_frame(buf: &[u8], max_frame_size: u32) -> Parsed<Frame> {
    if let Ok((_, header)) = frame_header(buf) {
        if header.payload_len > max_frame_size {
            return Parsed::Malformed(format!(
                "frame of {} bytes exceeds the maximum frame size {}",
                header.payload_len, max_frame_size
            ));
        }
    }
    match frame(buf) {
        Ok((rest, (header, payload))) => Parsed::Complete(
            Frame {
                kind: header.kind,
                flags: header.flags,
                stream_id: header.stream_id,
                payload: payload.to_vec(),
            },
            buf.len() - rest.len(),
        ),
        Err(Err::Incomplete(_)) => Parsed::Incomplete,
        Err(Err::Error(e)) | Err(Err::Failure(e)) => {
            Parsed::Malformed(format!("invalid frame ({:?})", e.code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_frame_layout() {
        let frame = Frame::settings(&[
            (settings::MAX_CONCURRENT_STREAMS, 100),
            (settings::INITIAL_WINDOW_SIZE, 65_535),
        ]);
        let bytes = frame.serialize();
        assert_eq!(&bytes[..9], &[0, 0, 12, 4, 0, 0, 0, 0, 0]);
        assert_eq!(
            frame.settings_parameters(),
            Some(vec![(3, 100), (4, 65_535)])
        );
    }

    #[test]
    fn incomplete_then_complete() {
        let frame = Frame::data(1, b"hello", true);
        let bytes = frame.serialize();
        for end in 0..bytes.len() {
            assert_eq!(parse_frame(&bytes[..end], DEFAULT_MAX_FRAME_SIZE), Parsed::Incomplete);
        }
        assert_eq!(
            parse_frame(&bytes, DEFAULT_MAX_FRAME_SIZE),
            Parsed::Complete(frame, bytes.len())
        );
    }

    #[test]
    fn oversized_and_raw_frames() {
        let frame = Frame::raw(0xfa, 0xff, 0x8000_0003, vec![0; 32]);
        let bytes = frame.serialize();
        assert!(matches!(parse_frame(&bytes, 16), Parsed::Malformed(_)));

        let Parsed::Complete(parsed, _) = parse_frame(&bytes, DEFAULT_MAX_FRAME_SIZE) else {
            panic!("raw frame should parse")
        };
        assert_eq!(parsed.kind, FrameType::Unknown(0xfa));
        assert_eq!(parsed.stream_id, 3);
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            Frame::rst_stream(1, error_code::CANCEL).error_code(),
            Some(error_code::CANCEL)
        );
        assert_eq!(
            Frame::goaway(7, error_code::PROTOCOL_ERROR, b"bye").error_code(),
            Some(error_code::PROTOCOL_ERROR)
        );
        assert!(Frame::ping([0; 8], true).has_flag(flags::ACK));
    }
}
