//! Framed transport for server links.
//!
//! Splits the byte stream into newline-terminated frames (a stray carriage
//! return before the newline is tolerated) and parses each into a
//! [`Message`]. When a [`LinkCipher`] is plugged in, frames are opened and
//! sealed below the framing layer, so the protocol logic never sees
//! ciphertext.
//!
//! `ERROR`, `CAPAB` and `CIPHER` frames travel in the clear in both
//! directions: they must stay decodable before encryption is established.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::cipher::{CipherError, LinkCipher};
use super::message::{Message, ParseError};

/// Upper bound on one frame. Sealed frames grow past the classic 512-byte
/// line limit, so the bound is generous.
const MAX_FRAME_LENGTH: usize = 16384;

/// Commands exchanged before (or about) encryption setup; never ciphered.
fn is_clear_frame(line: &str) -> bool {
    line.starts_with("ERROR") || line.starts_with("CAPAB") || line.starts_with("CIPHER")
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {MAX_FRAME_LENGTH} bytes")]
    FrameTooLong,
    #[error("frame is not valid UTF-8")]
    NotText,
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for one server link: newline framing plus the optional cipher.
#[derive(Debug, Default)]
pub struct LinkCodec {
    cipher: Option<LinkCipher>,
    /// True while discarding the tail of an oversized frame.
    skipping: bool,
}

impl LinkCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the cipher; every later non-clear frame is sealed/opened.
    pub fn enable_cipher(&mut self, cipher: LinkCipher) {
        self.cipher = Some(cipher);
    }

    pub fn cipher_active(&self) -> bool {
        self.cipher.is_some()
    }

    fn decode_line(&self, line: &str) -> Result<Option<Message>, CodecError> {
        let plain;
        let line = match &self.cipher {
            Some(cipher) if !is_clear_frame(line) => {
                plain = cipher.open(line)?;
                plain.as_str()
            }
            _ => line,
        };
        match Message::parse(line) {
            Ok(msg) => Ok(Some(msg)),
            // Blank frames between lines are tolerated, like blank lines
            // in the byte stream.
            Err(ParseError::Empty) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Decoder for LinkCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            if self.skipping {
                match src.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        warn!(bytes = pos + 1, "discarded tail of oversized frame");
                        src.advance(pos + 1);
                        self.skipping = false;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_FRAME_LENGTH {
                    warn!(bytes = src.len(), "oversized partial frame, skipping");
                    src.clear();
                    self.skipping = true;
                }
                return Ok(None);
            };

            if pos > MAX_FRAME_LENGTH {
                src.advance(pos + 1);
                return Err(CodecError::FrameTooLong);
            }

            let frame = src.split_to(pos);
            src.advance(1); // the newline itself

            // Tolerate a stray carriage return before the newline.
            let frame = match frame.last() {
                Some(b'\r') => &frame[..frame.len() - 1],
                _ => &frame[..],
            };
            let line = std::str::from_utf8(frame).map_err(|_| CodecError::NotText)?;

            match self.decode_line(line)? {
                Some(msg) => return Ok(Some(msg)),
                None => continue, // blank frame; look for the next one
            }
        }
    }
}

impl Encoder<Message> for LinkCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let wire = item.to_wire();
        let framed = match &self.cipher {
            Some(cipher) if !is_clear_frame(&wire) => cipher.seal(&wire)?,
            _ => wire,
        };
        dst.reserve(framed.len() + 2);
        dst.put_slice(framed.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut LinkCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn decodes_crlf_terminated_frame() {
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::from("PING :hub.tarn.test\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_bare_newline_frame() {
        // A stray carriage return is tolerated, not required.
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::from("BURST\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "BURST");
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::from("SERVER hub.tarn");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b".test secret 0 :Hub\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "SERVER");
        assert_eq!(msg.params[0], "hub.tarn.test");
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::from("BURST\r\nENDBURST\r\n");
        let msgs = decode_all(&mut codec, &mut buf);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].command, "BURST");
        assert_eq!(msgs[1].command, "ENDBURST");
    }

    #[test]
    fn skips_blank_frames() {
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::from("\r\n\r\nPONG :hub\r\n");
        let msgs = decode_all(&mut codec, &mut buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command, "PONG");
    }

    #[test]
    fn recovers_after_oversized_partial_frame() {
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::from(vec![b'A'; MAX_FRAME_LENGTH + 10].as_slice());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"tail\r\nPING :hub\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LinkCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("ENDBURST", vec![]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"ENDBURST\r\n");
    }

    // ── Cipher layering ──────────────────────────────────────────

    fn ciphered_pair() -> (LinkCodec, LinkCodec) {
        let mut a = LinkCodec::new();
        let mut b = LinkCodec::new();
        a.enable_cipher(LinkCipher::new(&[9u8; 16]).unwrap());
        b.enable_cipher(LinkCipher::new(&[9u8; 16]).unwrap());
        (a, b)
    }

    #[test]
    fn ciphered_frames_round_trip() {
        let (mut tx, mut rx) = ciphered_pair();
        let original = Message::with_source(
            "hub.tarn.test",
            "FTOPIC",
            vec!["#tarn".into(), "10".into(), "ana".into(), "hello there".into()],
        );
        let mut buf = BytesMut::new();
        tx.encode(original.clone(), &mut buf).unwrap();
        assert!(!buf.starts_with(b":hub.tarn.test"));
        let decoded = rx.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn error_and_capab_stay_clear() {
        let (mut tx, _) = ciphered_pair();
        for msg in [
            Message::new("ERROR", vec!["Invalid credentials".into()]),
            Message::new("CAPAB", vec!["FJOIN,FMODE".into()]),
            Message::new("CIPHER", vec!["hub.tarn.test".into()]),
        ] {
            let mut buf = BytesMut::new();
            let wire = msg.to_wire();
            tx.encode(msg, &mut buf).unwrap();
            let mut expect = wire.into_bytes();
            expect.extend_from_slice(b"\r\n");
            assert_eq!(&buf[..], expect.as_slice());
        }
    }

    #[test]
    fn clear_error_decodes_through_ciphered_codec() {
        // A peer that never finished cipher setup can still tell us why.
        let (_, mut rx) = ciphered_pair();
        let mut buf = BytesMut::from("ERROR :Invalid credentials\r\n");
        let msg = rx.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "ERROR");
        assert_eq!(msg.params, vec!["Invalid credentials"]);
    }

    #[test]
    fn ciphered_garbage_is_an_error() {
        let (_, mut rx) = ciphered_pair();
        let mut buf = BytesMut::from("definitely-not-a-sealed-frame\r\n");
        assert!(rx.decode(&mut buf).is_err());
    }
}
