//! Optional symmetric cipher for server links.
//!
//! A link block may carry a shared key of 16, 24, or 32 bytes
//! (AES-128/192/256-GCM). Any other length is a hard setup failure: the
//! link is refused, never silently downgraded to plaintext.
//!
//! Outbound frames are padded with a sentinel byte up to a multiple of the
//! key length, sealed as one block, and base64-encoded before framing.
//! Inbound frames reverse the steps and strip trailing sentinel bytes.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{AeadCore, Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Padding byte appended to plaintext before sealing; stripped after open.
const SENTINEL: u8 = 0x07;

/// Nonce length prepended to every sealed frame.
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("link cipher key must be 16, 24 or 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("frame could not be sealed")]
    Seal,
    #[error("frame is not valid base64")]
    Encoding,
    #[error("frame too short to carry a nonce")]
    Truncated,
    #[error("frame could not be opened (wrong key or tampered)")]
    Open,
    #[error("opened frame is not valid UTF-8")]
    NotText,
}

enum Keyed {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl std::fmt::Debug for Keyed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self {
            Keyed::Aes128(_) => 128,
            Keyed::Aes192(_) => 192,
            Keyed::Aes256(_) => 256,
        };
        write!(f, "Keyed({bits} bit)")
    }
}

/// Per-link cipher context.
#[derive(Debug)]
pub struct LinkCipher {
    keyed: Keyed,
    key_len: usize,
}

impl LinkCipher {
    /// Build a cipher from a configured key. Only 16/24/32-byte keys are
    /// accepted; everything else refuses the link.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let keyed = match key.len() {
            16 => Keyed::Aes128(
                Aes128Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength(key.len()))?,
            ),
            24 => Keyed::Aes192(
                Aes192Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength(key.len()))?,
            ),
            32 => Keyed::Aes256(
                Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength(key.len()))?,
            ),
            other => return Err(CipherError::KeyLength(other)),
        };
        Ok(LinkCipher {
            keyed,
            key_len: key.len(),
        })
    }

    /// Key length in bits, for operator notices.
    pub fn key_bits(&self) -> usize {
        self.key_len * 8
    }

    /// Seal one outbound frame: sentinel-pad to a key-length multiple,
    /// encrypt, base64 the nonce plus ciphertext.
    pub fn seal(&self, line: &str) -> Result<String, CipherError> {
        let mut padded = line.as_bytes().to_vec();
        while padded.len() % self.key_len != 0 {
            padded.push(SENTINEL);
        }

        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let sealed = match &self.keyed {
            Keyed::Aes128(c) => c.encrypt(&nonce, padded.as_ref()),
            Keyed::Aes192(c) => c.encrypt(&nonce, padded.as_ref()),
            Keyed::Aes256(c) => c.encrypt(&nonce, padded.as_ref()),
        }
        .map_err(|_| CipherError::Seal)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        Ok(B64.encode(frame))
    }

    /// Open one inbound frame and strip trailing sentinel padding.
    pub fn open(&self, frame: &str) -> Result<String, CipherError> {
        let raw = B64.decode(frame.trim()).map_err(|_| CipherError::Encoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);

        let mut plain = match &self.keyed {
            Keyed::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
            Keyed::Aes192(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
            Keyed::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
        }
        .map_err(|_| CipherError::Open)?;

        while plain.last() == Some(&SENTINEL) {
            plain.pop();
        }
        String::from_utf8(plain).map_err(|_| CipherError::NotText)
    }
}
