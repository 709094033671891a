//! CRLF frame demarcation for the JSON wire protocol.
//!
//! Every message on the wire is one UTF-8 JSON object followed by the two
//! bytes `\r\n`. There is no length prefix; the terminator is the only
//! frame boundary, so the decoder has to cope with frames split at
//! arbitrary byte positions, including in the middle of the terminator
//! itself.

use std::borrow::Cow;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The wire terminator between frames.
pub const FRAME_TERMINATOR: &[u8] = b"\r\n";

/// Errors produced while framing or deframing messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Codec that splits a byte stream into CRLF-terminated frames.
///
/// `decode` scans the accumulated buffer for `\r\n` and yields the bytes in
/// front of it; a partial trailing frame stays buffered. A lone `\r` at the
/// end of the buffer is retained as well, so a terminator split across two
/// reads reassembles correctly.
#[derive(Debug, Default)]
pub struct CrlfCodec {
    /// Index up to which the buffer has already been scanned for the
    /// terminator, to avoid rescanning on every partial read.
    next_index: usize,
}

impl CrlfCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for CrlfCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        let terminator = buf[self.next_index..]
            .windows(FRAME_TERMINATOR.len())
            .position(|window| window == FRAME_TERMINATOR)
            .map(|offset| self.next_index + offset);

        match terminator {
            Some(index) => {
                let frame = buf.split_to(index);
                buf.advance(FRAME_TERMINATOR.len());
                self.next_index = 0;
                Ok(Some(String::from_utf8(frame.to_vec())?))
            }
            None => {
                // Keep any suffix that is a proper prefix of the terminator
                // unscanned so the next read can complete it.
                self.next_index = buf.len().saturating_sub(FRAME_TERMINATOR.len() - 1);
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for CrlfCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: String, buf: &mut BytesMut) -> Result<(), FrameError> {
        buf.reserve(frame.len() + FRAME_TERMINATOR.len());
        buf.put_slice(frame.as_bytes());
        buf.put_slice(FRAME_TERMINATOR);
        Ok(())
    }
}

/// Escape raw TAB bytes inside a frame so a strict JSON parser accepts it.
///
/// Servers are allowed to ship literal tabs inside string values; the
/// receiving side escapes them to `\t` before parsing. Tabs that are part
/// of an already escaped sequence never appear raw, so a blanket
/// replacement is safe.
pub fn escape_raw_tabs(frame: &str) -> Cow<'_, str> {
    if frame.contains('\t') {
        Cow::Owned(frame.replace('\t', "\\t"))
    } else {
        Cow::Borrowed(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut CrlfCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_single_frame() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::from(&b"{\"uid\":\"a\"}\r\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["{\"uid\":\"a\"}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_many_frames_in_one_read() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\r\n{\"b\":2}\r\n{\"c\":3}\r\n"[..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]
        );
    }

    #[test]
    fn test_zero_frames_retains_partial() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"a\"");

        buf.extend_from_slice(b":1}\r\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_terminator_split_across_reads() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\r"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n{\"b\":2}\r\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["{\"a\":1}", "{\"b\":2}"]
        );
    }

    #[test]
    fn test_arbitrary_byte_boundaries() {
        let wire = b"{\"method\":\"check\",\"uid\":\"H\"}\r\n{\"uid\":\"H\",\"message\":\"Ok\"}\r\n";
        for split in 1..wire.len() {
            let mut codec = CrlfCodec::new();
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();

            buf.extend_from_slice(&wire[..split]);
            frames.extend(decode_all(&mut codec, &mut buf));
            buf.extend_from_slice(&wire[split..]);
            frames.extend(decode_all(&mut codec, &mut buf));

            assert_eq!(frames.len(), 2, "split at byte {split}");
            assert_eq!(frames[0], "{\"method\":\"check\",\"uid\":\"H\"}");
            assert_eq!(frames[1], "{\"uid\":\"H\",\"message\":\"Ok\"}");
        }
    }

    #[test]
    fn test_encode_appends_exactly_one_terminator() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("{\"a\":1}".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"a\":1}\r\n");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::new();
        let frame = "{\"method\":\"autocomplete\",\"source\":\"import os\"}";
        codec.encode(frame.to_string(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_tabs_preserved_on_the_wire() {
        let mut codec = CrlfCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode("{\"source\":\"\tindent\"}".to_string(), &mut buf)
            .unwrap();
        assert!(buf[..].contains(&b'\t'));
    }

    #[test]
    fn test_escape_raw_tabs() {
        assert_eq!(
            escape_raw_tabs("{\"source\":\"\tindent\"}"),
            "{\"source\":\"\\tindent\"}"
        );
        let clean = "{\"source\":\"plain\"}";
        assert!(matches!(escape_raw_tabs(clean), Cow::Borrowed(_)));

        let parsed: serde_json::Value =
            serde_json::from_str(&escape_raw_tabs("{\"source\":\"a\tb\"}")).unwrap();
        assert_eq!(parsed["source"], "a\tb");
    }
}
