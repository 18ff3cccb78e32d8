//! A `tokio_util::codec::{Decoder, Encoder}` for framing CRLF (or bare
//! `\n`) terminated lines on a byte stream.
//!
//! This is an alternative to a transport hand-rolling its own
//! `BufReader`/`Lines` loop: wrap a socket in `tokio_util::codec::Framed`
//! with a [`LineCodec`] and get a `Stream<Item = Result<String, _>>` /
//! `Sink<String>` pair instead.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Splits a byte stream on `\n`, stripping one trailing `\r` if present.
/// Encoding always appends `\r\n`, matching the wire format every reply
/// line in this crate already uses.
#[derive(Default)]
pub struct LineCodec {
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        LineCodec { next_index: 0 }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
            self.next_index = src.len();
            return Ok(None);
        };

        let newline_at = self.next_index + offset;
        let mut line = src.split_to(newline_at + 1);
        line.truncate(newline_at);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        self.next_index = 0;

        let text = String::from_utf8_lossy(&line).into_owned();
        Ok(Some(text))
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(line.as_bytes());
        if !line.ends_with("\r\n") {
            dst.extend_from_slice(b"\r\n");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_one_crlf_line_at_a_time() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"OK 1 -Version=1.0.0\r\nNEXT 2\r\n"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, "OK 1 -Version=1.0.0");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, "NEXT 2");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_more_bytes_on_partial_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"VERSi"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"on?\r\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line, "VERSion?");
    }

    #[test]
    fn encode_appends_crlf_if_missing() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("HELLO".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"HELLO\r\n");
    }

    #[test]
    fn encode_does_not_double_the_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("OK 1\r\n".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"OK 1\r\n");
    }
}
