//! AES-256-GCM chunk sealing
//!
//! Every chunk crosses the wire as `nonce || tag || ciphertext` with a
//! fresh 16-byte nonce drawn from the OS CSPRNG on each encryption,
//! including retransmissions of the same sequence number. The receiver
//! keeps whichever authenticated variant arrives first.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, KeyInit, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// GCM nonce length on the wire.
pub const NONCE_LEN: usize = 16;

/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Fixed per-chunk overhead: nonce plus tag.
pub const PACKET_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// AES-256-GCM instantiated with the 16-byte nonce the wire format carries.
type TunnelAead = AesGcm<Aes256, U16>;

#[derive(Error, Debug)]
pub enum CryptoError {
    /// Tag verification failed or the packet is otherwise undecryptable.
    /// Carries no detail so callers cannot distinguish a forged tag from
    /// a garbled packet.
    #[error("authentication failed")]
    AuthFailed,
}

/// One sealed chunk as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Packet {
    /// Serialize as `nonce || tag || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_OVERHEAD + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split a raw packet back into its three fields.
    ///
    /// Returns `None` for anything shorter than 33 bytes: the fixed
    /// overhead plus at least one ciphertext byte.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() <= PACKET_OVERHEAD {
            return None;
        }
        let mut nonce = [0u8; NONCE_LEN];
        let mut tag = [0u8; TAG_LEN];
        nonce.copy_from_slice(&raw[..NONCE_LEN]);
        tag.copy_from_slice(&raw[NONCE_LEN..PACKET_OVERHEAD]);
        Some(Self {
            nonce,
            tag,
            ciphertext: raw[PACKET_OVERHEAD..].to_vec(),
        })
    }
}

/// Symmetric cipher shared by both tunnel endpoints.
pub struct ChunkCipher {
    aead: TunnelAead,
}

impl ChunkCipher {
    /// Build a cipher from the 32-byte pre-shared key. Key length is
    /// enforced by the type; hex decoding and length checks happen in
    /// config validation before this is reached.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            aead: TunnelAead::new(Key::<TunnelAead>::from_slice(key)),
        }
    }

    /// Seal one chunk under a fresh random nonce. No associated data.
    pub fn seal(&self, plaintext: &[u8]) -> Packet {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut buf = plaintext.to_vec();
        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), b"", &mut buf)
            .expect("chunk sizes are far below the GCM length limit");

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(&tag);
        Packet {
            nonce,
            tag: tag_bytes,
            ciphertext: buf,
        }
    }

    /// Open a sealed chunk, verifying the tag in constant time.
    pub fn open(&self, packet: &Packet) -> Result<Vec<u8>, CryptoError> {
        let mut buf = packet.ciphertext.clone();
        self.aead
            .decrypt_in_place_detached(
                Nonce::<U16>::from_slice(&packet.nonce),
                b"",
                &mut buf,
                Tag::from_slice(&packet.tag),
            )
            .map_err(|_| CryptoError::AuthFailed)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ChunkCipher {
        ChunkCipher::new(&[0x42; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher();
        let packet = c.seal(b"covert payload");
        assert_eq!(packet.ciphertext.len(), b"covert payload".len());
        assert_eq!(c.open(&packet).unwrap(), b"covert payload");
    }

    #[test]
    fn test_nonces_are_unique_per_seal() {
        let c = cipher();
        let a = c.seal(b"same input");
        let b = c.seal(b"same input");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampering_any_field_fails_auth() {
        let c = cipher();
        let packet = c.seal(b"integrity matters");

        let mut bad = packet.clone();
        bad.ciphertext[0] ^= 0x01;
        assert!(matches!(c.open(&bad), Err(CryptoError::AuthFailed)));

        let mut bad = packet.clone();
        bad.nonce[3] ^= 0x80;
        assert!(matches!(c.open(&bad), Err(CryptoError::AuthFailed)));

        let mut bad = packet;
        bad.tag[15] ^= 0x10;
        assert!(matches!(c.open(&bad), Err(CryptoError::AuthFailed)));
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let packet = cipher().seal(b"for someone else");
        let other = ChunkCipher::new(&[0x17; 32]);
        assert!(matches!(other.open(&packet), Err(CryptoError::AuthFailed)));
    }

    #[test]
    fn test_packet_bytes_roundtrip() {
        let packet = cipher().seal(b"wire form");
        let raw = packet.to_bytes();
        assert_eq!(raw.len(), b"wire form".len() + PACKET_OVERHEAD);
        assert_eq!(Packet::from_bytes(&raw).unwrap(), packet);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(Packet::from_bytes(&[]).is_none());
        assert!(Packet::from_bytes(&[0u8; PACKET_OVERHEAD]).is_none());
        assert!(Packet::from_bytes(&[0u8; PACKET_OVERHEAD + 1]).is_some());
    }
}
