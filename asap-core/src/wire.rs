//! Framing: length-prefix (4 bytes LE) + version byte + bincode payload.

use std::io::{self, Read, Write};

use crate::error::AsapError;
use crate::protocol::{Pdu, PROTOCOL_VERSION};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a PDU into a single frame: 4 bytes LE length + version + bincode payload.
pub fn encode_frame(pdu: &Pdu) -> Result<Vec<u8>, FrameEncodeError> {
    pdu.validate().map_err(|e| FrameEncodeError::Invalid(e.to_string()))?;
    let payload = bincode::serialize(pdu).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() + 1;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a PDU into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("invalid pdu: {0}")]
    Invalid(String),
}

/// Decode one frame from the front of `bytes`. Returns the PDU and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Pdu, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let pdu = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((pdu, LEN_SIZE + len))
}

fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    Ok(len as usize)
}

fn decode_body(body: &[u8]) -> Result<Pdu, FrameDecodeError> {
    if body[0] != PROTOCOL_VERSION {
        return Err(FrameDecodeError::Version(body[0]));
    }
    let pdu: Pdu = bincode::deserialize(&body[1..]).map_err(FrameDecodeError::Decode)?;
    pdu.validate()
        .map_err(|e| FrameDecodeError::Invalid(e.to_string()))?;
    Ok(pdu)
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("empty frame")]
    Empty,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("invalid pdu: {0}")]
    Invalid(String),
}

impl From<FrameEncodeError> for AsapError {
    fn from(e: FrameEncodeError) -> Self {
        AsapError::Protocol(e.to_string())
    }
}

impl From<FrameDecodeError> for AsapError {
    fn from(e: FrameDecodeError) -> Self {
        AsapError::Protocol(e.to_string())
    }
}

/// Read exactly one PDU from a blocking stream.
///
/// End of stream and IO errors are transport faults; anything wrong with the
/// frame itself is a protocol fault.
pub fn read_pdu<R: Read + ?Sized>(input: &mut R) -> Result<Pdu, AsapError> {
    let mut header = [0u8; LEN_SIZE];
    input.read_exact(&mut header)?;
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    input.read_exact(&mut body)?;
    Ok(decode_body(&body)?)
}

/// Write one PDU as a single frame and flush.
pub fn write_pdu<W: Write + ?Sized>(out: &mut W, pdu: &Pdu) -> Result<(), AsapError> {
    let frame = encode_frame(pdu)?;
    write_frame(out, &frame)?;
    Ok(())
}

fn write_frame<W: Write + ?Sized>(out: &mut W, frame: &[u8]) -> io::Result<()> {
    out.write_all(frame)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_assimilate() -> Pdu {
        Pdu::Assimilate {
            sender: "Alice".into(),
            format: "chat".into(),
            uri: "abcChat".into(),
            era: 3,
            messages: vec![b"Hi Bob".to_vec(), b"Hi Bob again".to_vec()],
        }
    }

    #[test]
    fn frame_carries_pdu() {
        let pdu = sample_assimilate();
        let frame = encode_frame(&pdu).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_assimilate()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE + 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_pdus_in_one_buffer() {
        let a = Pdu::introduction("Alice");
        let b = Pdu::Interest {
            sender: "Alice".into(),
            format: "chat".into(),
        };
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (m2, _) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }

    #[test]
    fn wrong_version_rejected() {
        let mut frame = encode_frame(&sample_assimilate()).unwrap();
        frame[LEN_SIZE] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::Version(_))
        ));
    }

    #[test]
    fn encode_rejects_bad_sender() {
        let pdu = Pdu::Interest {
            sender: String::new(),
            format: "chat".into(),
        };
        assert!(matches!(
            encode_frame(&pdu),
            Err(FrameEncodeError::Invalid(_))
        ));
    }

    #[test]
    fn stream_read_write() {
        let mut buf = Vec::new();
        write_pdu(&mut buf, &sample_assimilate()).unwrap();
        let pdu = read_pdu(&mut Cursor::new(buf)).unwrap();
        assert_eq!(pdu, sample_assimilate());
    }

    #[test]
    fn eof_is_transport_fault() {
        let frame = encode_frame(&sample_assimilate()).unwrap();
        let err = read_pdu(&mut Cursor::new(&frame[..frame.len() - 1])).unwrap_err();
        assert!(err.is_transport());
        let err = read_pdu(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn garbage_is_protocol_fault() {
        let mut frame = 5u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[PROTOCOL_VERSION, 0xff, 0xff, 0xff, 0xff]);
        let err = read_pdu(&mut Cursor::new(frame)).unwrap_err();
        assert!(err.is_protocol());

        let huge = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        let err = read_pdu(&mut Cursor::new(huge)).unwrap_err();
        assert!(err.is_protocol());
    }
}
