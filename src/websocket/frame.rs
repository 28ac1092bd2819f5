//! RFC 6455 Base Framing
//!
//! ```text
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-------+-+-------------+-------------------------------+
//!  |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//!  |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//!  |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//!  | |1|2|3|       |K|             |                               |
//!  +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//!  |     Extended payload length continued, if payload len == 127  |
//!  + - - - - - - - - - - - - - - - +-------------------------------+
//!  |                               |Masking-key, if MASK set to 1  |
//!  +-------------------------------+-------------------------------+
//!  | Masking-key (continued)       |          Payload Data         |
//!  +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The codec is stateless: [`unpack`] either takes one whole frame off the
//! front of the buffer or leaves the buffer untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload accepted by [`unpack`] (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Control frame payloads are limited to 125 bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status codes used by the server.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// Errors produced while decoding frames or reassembling messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// The most significant bit of a 64-bit length was set
    #[error("payload length overflows 63 bits")]
    LengthOverflow,

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("fragmented control frame")]
    FragmentedControlFrame,

    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooLarge(u64),

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    MessageInterrupted,

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// The close code sent to the peer before disconnecting.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::PayloadTooLarge { .. } => close_code::MESSAGE_TOO_BIG,
            FrameError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> FrameResult<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One WebSocket frame. The payload is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key; when present the payload is masked on the wire
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// A final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// A close frame carrying an optional status code and reason.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let mut payload = BytesMut::new();
        if let Some(code) = code {
            payload.put_u16(code);
            payload.put_slice(reason.as_bytes());
        }
        Self::new(Opcode::Close, payload.freeze())
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// XORs `payload` in place with the repeating 4-byte `mask`.
///
/// Applying the same mask twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Decodes one frame from the front of `buf` with the default size limit.
pub fn unpack(buf: &mut BytesMut) -> FrameResult<Option<Frame>> {
    unpack_with_limit(buf, MAX_PAYLOAD_SIZE)
}

/// Decodes one frame from the front of `buf`.
///
/// # Returns
///
/// - `Ok(Some(frame))` - a frame was removed from `buf`
/// - `Ok(None)` - not enough bytes yet; `buf` is untouched
/// - `Err(e)` - the header is invalid; `buf` is untouched
pub fn unpack_with_limit(buf: &mut BytesMut, max_payload: usize) -> FrameResult<Option<Frame>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];
    let second = buf[1];

    let fin = first & 0x80 != 0;
    if first & 0x70 != 0 {
        return Err(FrameError::ReservedBitsSet);
    }
    let opcode = Opcode::from_u8(first & 0x0F)?;
    let masked = second & 0x80 != 0;

    let (len, mut header_len) = match second & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let high = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
            let low = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
            if high & 0x8000_0000 != 0 {
                return Err(FrameError::LengthOverflow);
            }
            ((u64::from(high) << 32) | u64::from(low), 10)
        }
        n => (u64::from(n), 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControlFrame);
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlFrameTooLarge(len));
        }
    }
    if len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    let len = len as usize;

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < header_len + len {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(len);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        mask,
        payload: payload.freeze(),
    }))
}

/// Encodes `frame` onto the end of `dst` using the shortest length form.
pub fn pack_into(frame: &Frame, dst: &mut BytesMut) {
    let len = frame.payload.len();
    dst.reserve(14 + len);

    let fin_bit = if frame.fin { 0x80 } else { 0x00 };
    dst.put_u8(fin_bit | frame.opcode as u8);

    let mask_bit = if frame.mask.is_some() { 0x80 } else { 0x00 };
    if len <= 125 {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match frame.mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

/// Encodes `frame` into a fresh buffer.
pub fn pack(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::new();
    pack_into(frame, &mut dst);
    dst.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn decode(bytes: &[u8]) -> FrameResult<Option<Frame>> {
        unpack(&mut BytesMut::from(bytes))
    }

    #[test]
    fn test_rfc_unmasked_text() {
        let frame = decode(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f])
            .unwrap()
            .unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.mask, None);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_rfc_masked_text() {
        let raw = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = decode(&raw).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.mask, Some(MASK));
        assert_eq!(&frame.payload[..], b"Hello");
        assert_eq!(&pack(&frame)[..], &raw[..]);
    }

    #[test]
    fn test_rfc_fragmented_text() {
        let mut buf = BytesMut::from(&[0x01, 0x03, 0x48, 0x65, 0x6c, 0x80, 0x02, 0x6c, 0x6f][..]);
        let first = unpack(&mut buf).unwrap().unwrap();
        assert!(!first.fin);
        assert_eq!(first.opcode, Opcode::Text);
        assert_eq!(&first.payload[..], b"Hel");

        let second = unpack(&mut buf).unwrap().unwrap();
        assert!(second.fin);
        assert_eq!(second.opcode, Opcode::Continuation);
        assert_eq!(&second.payload[..], b"lo");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rfc_ping_and_masked_pong() {
        let ping = decode(&[0x89, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f])
            .unwrap()
            .unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert_eq!(&ping.payload[..], b"Hello");

        let pong = decode(&[0x8a, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
            .unwrap()
            .unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"Hello");
    }

    #[test]
    fn test_rfc_extended_lengths() {
        let frame = Frame::binary(vec![0u8; 256]);
        assert_eq!(&pack(&frame)[..4], &[0x82, 0x7E, 0x01, 0x00]);

        let frame = Frame::binary(vec![0u8; 65536]);
        assert_eq!(
            &pack(&frame)[..10],
            &[0x82, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_length_boundaries() {
        for (len, header) in [(125, 2), (126, 4), (127, 4), (65535, 4), (65536, 10)] {
            let frame = Frame::binary(vec![7u8; len]);
            let packed = pack(&frame);
            assert_eq!(packed.len(), header + len, "len {}", len);
            let decoded = decode(&packed).unwrap().unwrap();
            assert_eq!(decoded, frame, "len {}", len);
        }
    }

    #[test]
    fn test_roundtrip_with_mask() {
        for frame in [
            Frame::text("masked payload").with_mask([1, 2, 3, 4]),
            Frame::binary(vec![0xAB; 300]).with_mask(MASK).with_fin(false),
            Frame::new(Opcode::Continuation, "tail"),
            Frame::close(Some(close_code::NORMAL), "bye").with_mask(MASK),
            Frame::ping(""),
        ] {
            assert_eq!(decode(&pack(&frame)).unwrap().unwrap(), frame);
        }
    }

    #[test]
    fn test_mask_is_involutive() {
        let original = b"The quick brown fox".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, MASK);
        assert_ne!(data, original);
        apply_mask(&mut data, MASK);
        assert_eq!(data, original);
    }

    #[test]
    fn test_partial_frame_leaves_buffer_untouched() {
        let packed = pack(&Frame::text("Hello").with_mask(MASK));
        for cut in 0..packed.len() {
            let mut buf = BytesMut::from(&packed[..cut]);
            assert_eq!(unpack(&mut buf).unwrap(), None, "cut {}", cut);
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_trailing_bytes_stay_in_buffer() {
        let mut buf = BytesMut::new();
        pack_into(&Frame::text("one"), &mut buf);
        pack_into(&Frame::text("two"), &mut buf);
        buf.put_u8(0x81);
        assert_eq!(&unpack(&mut buf).unwrap().unwrap().payload[..], b"one");
        assert_eq!(&unpack(&mut buf).unwrap().unwrap().payload[..], b"two");
        assert_eq!(unpack(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], &[0x81]);
    }

    #[test]
    fn test_reserved_bits_rejected() {
        assert_eq!(decode(&[0xC1, 0x00]), Err(FrameError::ReservedBitsSet));
        assert_eq!(decode(&[0x91, 0x00]), Err(FrameError::ReservedBitsSet));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert_eq!(decode(&[0x83, 0x00]), Err(FrameError::InvalidOpcode(0x3)));
        assert_eq!(decode(&[0x8B, 0x00]), Err(FrameError::InvalidOpcode(0xB)));
    }

    #[test]
    fn test_length_top_bit_rejected() {
        let raw = [0x82, 0x7F, 0x80, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(decode(&raw), Err(FrameError::LengthOverflow));
    }

    #[test]
    fn test_payload_limit_checked_from_header() {
        let mut buf = BytesMut::from(&[0x82, 0x7E, 0x01, 0x00][..]);
        let err = unpack_with_limit(&mut buf, 255).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { size: 256, max: 255 });
        assert_eq!(err.close_code(), close_code::MESSAGE_TOO_BIG);
    }

    #[test]
    fn test_control_frame_rules() {
        assert_eq!(decode(&[0x09, 0x00]), Err(FrameError::FragmentedControlFrame));
        assert_eq!(
            decode(&[0x89, 0x7E, 0x00, 0x7E]),
            Err(FrameError::ControlFrameTooLarge(126))
        );
    }

    #[test]
    fn test_close_code() {
        let frame = Frame::close(Some(1001), "going away");
        assert_eq!(frame.close_code(), Some(1001));
        assert_eq!(&frame.payload[2..], b"going away");
        assert_eq!(Frame::close(None, "").close_code(), None);
        assert_eq!(Frame::text("ab").close_code(), None);
    }
}
