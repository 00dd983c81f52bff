//! Curve25519 key primitives.
//!
//! Static and ephemeral keys share one representation: a clamped 32-byte
//! scalar for the private half and a 32-byte Montgomery u-coordinate for the
//! public half. Shared secrets come from raw scalar multiplication and are
//! only ever used as AEAD key material.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Length of private keys, public keys and shared secrets in bytes.
pub const KEY_SIZE: usize = 32;

/// Length of a key fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 8;

/// Length of a key id in bytes (SHA-256 output truncated to 8 bytes).
const KEY_ID_SIZE: usize = 8;

fn clamp(bytes: &mut [u8; KEY_SIZE]) {
    bytes[0] &= 248;
    bytes[31] = (bytes[31] & 127) | 64;
}

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE]> {
    let decoded = STANDARD.decode(s.trim())?;
    if decoded.len() != KEY_SIZE {
        return Err(ProtocolError::InvalidKeyEncoding(format!(
            "expected {} bytes, got {}",
            KEY_SIZE,
            decoded.len()
        )));
    }
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

/// A compact identity or proof tag: bytes 4..12 of the MD5 digest of a
/// public key or shared secret.
///
/// Fingerprints are not secret and are not a security boundary on their own.
/// They select an allow-list entry; the shared-secret proof that follows is
/// what authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFingerprint([u8; FINGERPRINT_SIZE]);

impl KeyFingerprint {
    /// Computes the fingerprint of arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        let digest = Md5::digest(data);
        let mut fp = [0u8; FINGERPRINT_SIZE];
        fp.copy_from_slice(&digest[4..12]);
        Self(fp)
    }

    /// Creates a fingerprint from raw bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Reads a fingerprint from the first eight bytes of `data`.
    ///
    /// Returns `None` if `data` is shorter than a fingerprint.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; FINGERPRINT_SIZE] = data.get(..FINGERPRINT_SIZE)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Returns the raw bytes of this fingerprint.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Constant-time comparison, used when the fingerprint is a proof.
    pub fn ct_equals(&self, other: &KeyFingerprint) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A Curve25519 public key.
#[derive(Clone, Copy)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Decodes a key from its base64 text form.
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }

    /// Encodes this key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Returns the allow-list fingerprint of this key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        KeyFingerprint::of(&self.0)
    }

    /// Generates a human-readable key id for logs and listings.
    ///
    /// Formatted as groups of 4 hex characters separated by colons,
    /// for example: `a1b2:c3d4:e5f6:7890`
    pub fn key_id(&self) -> String {
        use sha2::Sha256;
        let hash = Sha256::digest(self.0);
        hash[..KEY_ID_SIZE]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Returns true if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; KEY_SIZE]).into()
    }

    /// Constant-time equality.
    pub fn equals(&self, other: &PublicKey) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for PublicKey {}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.key_id())
    }
}

impl FromStr for PublicKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

/// A clamped Curve25519 private scalar. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new private key from the operating system RNG.
    ///
    /// Fails only if the entropy source fails.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| ProtocolError::Entropy(e.to_string()))?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Creates a private key from raw bytes, clamping them.
    pub fn from_bytes(mut bytes: [u8; KEY_SIZE]) -> Self {
        clamp(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw (clamped) scalar bytes.
    ///
    /// **Security Warning**: only use this for secure storage.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Decodes a key from its base64 text form.
    pub fn from_base64(s: &str) -> Result<Self> {
        let mut bytes = decode_key(s)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Encodes this key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Derives the public key by scalar-base multiplication.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519(self.0, X25519_BASEPOINT_BYTES))
    }

    /// Computes the Diffie-Hellman shared secret with a peer public key.
    pub fn shared_secret(&self, peer: &PublicKey) -> SharedSecret {
        SharedSecret(x25519(self.0, peer.0))
    }

    /// Returns true if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; KEY_SIZE]).into()
    }

    /// Constant-time equality.
    pub fn equals(&self, other: &PrivateKey) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

impl FromStr for PrivateKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

/// A 32-byte Diffie-Hellman output. Never transmitted. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    /// Returns the raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Returns the proof fingerprint of this secret.
    pub fn fingerprint(&self) -> KeyFingerprint {
        KeyFingerprint::of(&self.0)
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// A long-lived identity keypair.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticKeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl StaticKeyPair {
    /// Generates a new random static keypair.
    pub fn generate() -> Result<Self> {
        PrivateKey::generate().map(Self::from_private)
    }

    /// Builds the keypair for an existing private key.
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Returns the private key.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for StaticKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyPair")
            .field("public_key", &self.public)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// A single-message keypair.
///
/// Deriving the shared secret consumes the pair, so the private half cannot
/// be used for a second message.
pub struct EphemeralKeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generates a fresh ephemeral keypair.
    pub fn generate() -> Result<Self> {
        let private = PrivateKey::generate()?;
        let public = private.public_key();
        Ok(Self { private, public })
    }

    /// Returns the public half, which travels on the wire.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Consumes the pair and returns the shared secret with `peer`.
    pub fn into_shared_secret(self, peer: &PublicKey) -> SharedSecret {
        self.private.shared_secret(peer)
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_clamped() {
        for _ in 0..16 {
            let key = PrivateKey::generate().unwrap();
            let bytes = key.as_bytes();
            assert_eq!(bytes[0] & 0b0000_0111, 0);
            assert_eq!(bytes[31] & 0b1000_0000, 0);
            assert_eq!(bytes[31] & 0b0100_0000, 0b0100_0000);
        }
    }

    #[test]
    fn test_from_bytes_clamps() {
        let key = PrivateKey::from_bytes([0xFF; KEY_SIZE]);
        assert_eq!(key.as_bytes()[0], 0xF8);
        assert_eq!(key.as_bytes()[31], 0x7F);
    }

    #[test]
    fn test_key_generation_produces_unique_keys() {
        let a = StaticKeyPair::generate().unwrap();
        let b = StaticKeyPair::generate().unwrap();
        assert_ne!(a.private_key(), b.private_key());
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        for _ in 0..8 {
            let a = StaticKeyPair::generate().unwrap();
            let b = StaticKeyPair::generate().unwrap();
            let ab = a.private_key().shared_secret(b.public_key());
            let ba = b.private_key().shared_secret(a.public_key());
            assert_eq!(ab, ba);
        }
    }

    #[test]
    fn test_ephemeral_matches_static_agreement() {
        let server = StaticKeyPair::generate().unwrap();
        let ephemeral = EphemeralKeyPair::generate().unwrap();
        let eph_public = *ephemeral.public_key();

        let sender_side = ephemeral.into_shared_secret(server.public_key());
        let receiver_side = server.private_key().shared_secret(&eph_public);
        assert_eq!(sender_side, receiver_side);
    }

    #[test]
    fn test_rfc7748_public_key_vector() {
        // Alice's key pair from RFC 7748 section 6.1.
        let private =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap();
        let expected =
            hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                .unwrap();
        let key = PrivateKey::from_bytes(private.try_into().unwrap());
        assert_eq!(key.public_key().as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn test_base64_roundtrip() {
        let pair = StaticKeyPair::generate().unwrap();

        let text = pair.private_key().to_base64();
        let restored = PrivateKey::from_base64(&text).unwrap();
        assert_eq!(&restored, pair.private_key());

        let text = pair.public_key().to_base64();
        let restored: PublicKey = text.parse().unwrap();
        assert_eq!(&restored, pair.public_key());
        assert_eq!(restored.to_string(), text);
    }

    #[test]
    fn test_known_key_text_derives_expected_public_key() {
        let private =
            PrivateKey::from_base64("qHTyTvwGYKFeww0tn0/Gdn7vkPvfAsfSUFeXwNUCpnU=").unwrap();
        let public = private.public_key();
        assert_eq!(PublicKey::from_base64(&public.to_base64()).unwrap(), public);
        assert_eq!(private.to_base64().len(), 44);
    }

    #[test]
    fn test_decode_wrong_length_fails() {
        let short = STANDARD.encode([1u8; 16]);
        let err = PublicKey::from_base64(&short).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidKeyEncoding(_)));

        let long = STANDARD.encode([1u8; 33]);
        let err = PrivateKey::from_base64(&long).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidKeyEncoding(_)));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = PublicKey::from_base64("not base64 at all!").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidKeyEncoding(_)));
    }

    #[test]
    fn test_is_zero() {
        assert!(PublicKey::from_bytes([0u8; KEY_SIZE]).is_zero());
        assert!(!StaticKeyPair::generate().unwrap().public_key().is_zero());
        assert!(!PrivateKey::generate().unwrap().is_zero());
    }

    #[test]
    fn test_fingerprint_is_md5_middle_bytes() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        let fp = KeyFingerprint::of(b"");
        assert_eq!(fp.to_string(), "8f00b204e9800998");
    }

    #[test]
    fn test_fingerprint_from_slice() {
        let fp = KeyFingerprint::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(fp.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(KeyFingerprint::from_slice(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_fingerprint_ct_equals() {
        let pair = StaticKeyPair::generate().unwrap();
        let a = pair.public_key().fingerprint();
        let b = pair.public_key().fingerprint();
        assert!(a.ct_equals(&b));

        let other = StaticKeyPair::generate().unwrap().public_key().fingerprint();
        assert!(!a.ct_equals(&other));
    }

    #[test]
    fn test_key_id_format() {
        let pair = StaticKeyPair::generate().unwrap();
        let id = pair.public_key().key_id();

        // 4 groups of 4 hex chars: 4*4 + 3 = 19 characters
        assert_eq!(id.len(), 19);
        assert_eq!(id.matches(':').count(), 3);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == ':'));
    }

    #[test]
    fn test_debug_redacts_private_material() {
        let pair = StaticKeyPair::generate().unwrap();
        let debug = format!("{:?}", pair);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&pair.private_key().to_base64()));

        let secret = pair.private_key().shared_secret(pair.public_key());
        assert_eq!(format!("{:?}", secret), "SharedSecret([REDACTED])");
    }

    #[test]
    fn test_known_pair_vectors() {
        let server =
            PrivateKey::from_base64("qHTyTvwGYKFeww0tn0/Gdn7vkPvfAsfSUFeXwNUCpnU=").unwrap();
        let client =
            PrivateKey::from_base64("iBv818sWwMDjU/IdvVyb2hAvlTrm6S/xf9oSFySEVnw=").unwrap();

        assert_eq!(
            server.public_key().to_base64(),
            "7S7lkXbp3Xomf9WdCbvL68hxEcdGxT4X+Wco4gKa2CM="
        );
        assert_eq!(
            client.public_key().to_base64(),
            "ns1Wlf1dcYaE1gRsgPwU5hy6Kl/psRk6qV84JF24fQI="
        );

        let secret = client.shared_secret(&server.public_key());
        assert_eq!(
            hex::encode(secret.as_bytes()),
            "77d823b039e99105a5abccdd01bc121784c373f702d87de9af7cb57860c1001b"
        );
        assert_eq!(secret.fingerprint().to_string(), "72ed572854c49455");
        assert_eq!(client.public_key().fingerprint().to_string(), "f82a67625b5168d6");
    }
}
