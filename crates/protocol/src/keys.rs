//! RSA key material: the device's long-term wireless-debugging identity.
//!
//! This module owns the RSA-2048 key pair, its on-disk PKCS#8 persistence,
//! the self-signed X.509 certificate presented during TLS upgrades, raw
//! token signing for AUTH challenges, and the ADB public-key blob.
//!
//! # The ADB public-key blob
//!
//! Daemons expect the public key in a fixed 524-byte little-endian
//! structure carrying Montgomery-reduction parameters:
//!
//! - u32: modulus length in 32-bit words (always 64)
//! - u32: -1 / modulus mod 2^32
//! - 64 x u32: the modulus
//! - 64 x u32: R^2 mod modulus, with R = 2^2048
//! - u32: the public exponent
//!
//! The structure is base64-encoded and suffixed with a space, a
//! human-readable device name, and a terminating NUL. The byte-for-byte
//! shape is dictated by the peer daemon and must not be simplified.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::error::{ProtocolError, Result};

/// RSA modulus size in bits.
pub const KEY_BITS: usize = 2048;

/// Modulus length in 32-bit words.
const MODULUS_WORDS: usize = KEY_BITS / 32;

/// Modulus length in bytes.
const MODULUS_BYTES: usize = KEY_BITS / 8;

/// Size of the raw (pre-base64) public key structure.
pub const ADB_PUBLIC_KEY_SIZE: usize = 4 + 4 + MODULUS_BYTES + MODULUS_BYTES + 4;

/// Common name used in the self-signed certificate.
const CERT_COMMON_NAME: &str = "ADBPairing";

/// Certificate validity window start, relative to creation.
const CERT_NOT_BEFORE_DAYS: i64 = 1;

/// Certificate validity window end, relative to creation.
const CERT_NOT_AFTER_DAYS: i64 = 365 * 10;

/// The device's long-term RSA identity.
///
/// Generated once and reused for the process (and, via the key file, the
/// installation) lifetime. Regenerating the key invalidates the peer's
/// trust of this device and forces re-pairing.
pub struct KeyMaterial {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    pkcs8_der: Vec<u8>,
    certificate: CertificateDer<'static>,
    device_name: String,
    adb_public_key: OnceLock<Vec<u8>>,
}

impl KeyMaterial {
    /// Loads the private key from `path`, or generates and persists a
    /// fresh RSA-2048 pair if the file is missing or unparseable.
    ///
    /// Persistence failure is logged and otherwise ignored: an in-memory
    /// key is still usable for the current process lifetime.
    ///
    /// Key generation is CPU-bound; callers on an async runtime should
    /// wrap this in `spawn_blocking`.
    pub fn load_or_create(path: &Path, device_name: &str) -> Result<Self> {
        if let Ok(bytes) = fs::read(path) {
            match RsaPrivateKey::from_pkcs8_der(&bytes) {
                Ok(private_key) => return Self::from_private_key(private_key, device_name),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to parse key file, generating a new key pair");
                }
            }
        }

        let material = Self::generate(device_name)?;
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(path, &material.pkcs8_der) {
            warn!(path = %path.display(), error = %err, "failed to persist private key, continuing with in-memory key");
        }
        Ok(material)
    }

    /// Generates a fresh in-memory RSA-2048 key pair.
    pub fn generate(device_name: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)?;
        Self::from_private_key(private_key, device_name)
    }

    fn from_private_key(private_key: RsaPrivateKey, device_name: &str) -> Result<Self> {
        let public_key = RsaPublicKey::from(&private_key);
        let pkcs8_der = private_key
            .to_pkcs8_der()
            .map_err(|e| ProtocolError::Key(format!("PKCS#8 encoding failed: {e}")))?
            .as_bytes()
            .to_vec();
        let certificate = generate_certificate(&pkcs8_der)?;
        Ok(Self {
            private_key,
            public_key,
            pkcs8_der,
            certificate,
            device_name: device_name.to_string(),
            adb_public_key: OnceLock::new(),
        })
    }

    /// The device name advertised alongside the public key.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The private key in PKCS#8 DER form, as persisted to disk and as
    /// handed to the TLS stack.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    /// The private key as an owned DER structure for TLS client auth.
    pub fn private_key_der(&self) -> PrivatePkcs8KeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.pkcs8_der.clone())
    }

    /// The self-signed X.509 certificate presented as our TLS identity.
    pub fn certificate_der(&self) -> CertificateDer<'static> {
        self.certificate.clone()
    }

    /// The ADB public-key blob: base64 of the 524-byte structure plus
    /// `" <device name>\0"`. Computed once and cached.
    pub fn adb_public_key(&self) -> &[u8] {
        self.adb_public_key.get_or_init(|| {
            let raw = encode_raw_public_key(&self.public_key);
            let mut blob = BASE64.encode(raw).into_bytes();
            blob.push(b' ');
            blob.extend_from_slice(self.device_name.as_bytes());
            blob.push(0);
            blob
        })
    }

    /// Signs an AUTH challenge token: PKCS#1 v1.5 over a SHA-256 digest of
    /// the token bytes, no further wrapping.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key
            .try_sign(token)
            .map_err(|e| ProtocolError::Key(format!("token signing failed: {e}")))?;
        Ok(signature.to_vec())
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("device_name", &self.device_name)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Builds the self-signed certificate: `CN=ADBPairing`, valid from one day
/// ago to ten years out, signed SHA256withRSA with our own key.
fn generate_certificate(pkcs8_der: &[u8]) -> Result<CertificateDer<'static>> {
    let key_der = PrivatePkcs8KeyDer::from(pkcs8_der);
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &PKCS_RSA_SHA256)
        .map_err(|e| ProtocolError::Key(format!("certificate key setup failed: {e}")))?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, CERT_COMMON_NAME);

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(CERT_NOT_BEFORE_DAYS);
    params.not_after = now + Duration::days(CERT_NOT_AFTER_DAYS);

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| ProtocolError::Key(format!("certificate generation failed: {e}")))?;
    Ok(certificate.der().clone())
}

/// Encodes the raw 524-byte public key structure.
fn encode_raw_public_key(public_key: &RsaPublicKey) -> [u8; ADB_PUBLIC_KEY_SIZE] {
    let modulus = public_key.n();
    // R^2 mod n with R = 2^2048, i.e. 2^4096 mod n.
    let rr = BigUint::from(2u32).modpow(&BigUint::from(2 * KEY_BITS as u32), modulus);

    let mut buf = [0u8; ADB_PUBLIC_KEY_SIZE];
    let mut offset = 0;
    let mut put_u32 = |buf: &mut [u8; ADB_PUBLIC_KEY_SIZE], value: u32| {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        offset += 4;
    };

    put_u32(&mut buf, MODULUS_WORDS as u32);
    put_u32(&mut buf, n0inv32(modulus));
    for word in le_words(modulus) {
        put_u32(&mut buf, word);
    }
    for word in le_words(&rr) {
        put_u32(&mut buf, word);
    }
    put_u32(&mut buf, low_u32(public_key.e()));
    buf
}

/// Splits a big integer into 64 little-endian 32-bit words.
fn le_words(value: &BigUint) -> [u32; MODULUS_WORDS] {
    let bytes = value.to_bytes_le();
    let mut words = [0u32; MODULUS_WORDS];
    for (i, chunk) in bytes.chunks(4).enumerate().take(MODULUS_WORDS) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        words[i] = u32::from_le_bytes(word);
    }
    words
}

/// Computes -(n^-1) mod 2^32 for the odd modulus `n`.
///
/// Newton's iteration on the low 32 bits: the initial guess is correct to
/// 3 bits and each round doubles that, so four rounds cover a word.
fn n0inv32(modulus: &BigUint) -> u32 {
    let n0 = low_u32(modulus);
    let mut inv = n0;
    for _ in 0..4 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    inv.wrapping_neg()
}

/// The low 32 bits of a big integer.
fn low_u32(value: &BigUint) -> u32 {
    let bytes = value.to_bytes_le();
    let mut word = [0u8; 4];
    let len = bytes.len().min(4);
    word[..len].copy_from_slice(&bytes[..len]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RSA generation is slow; share one key pair across the module.
    fn test_key() -> &'static KeyMaterial {
        static KEY: OnceLock<KeyMaterial> = OnceLock::new();
        KEY.get_or_init(|| KeyMaterial::generate("unit-test").unwrap())
    }

    #[test]
    fn test_raw_blob_layout() {
        let key = test_key();
        let raw = encode_raw_public_key(&key.public_key);
        assert_eq!(raw.len(), 524);

        // Word count field.
        let words = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_eq!(words, 64);

        // Exponent field.
        let e = u32::from_le_bytes([raw[520], raw[521], raw[522], raw[523]]);
        assert_eq!(e, 65537);

        // Modulus words round-trip against the actual modulus bytes.
        let modulus_bytes = key.public_key.n().to_bytes_le();
        assert_eq!(&raw[8..8 + modulus_bytes.len()], &modulus_bytes[..]);
    }

    #[test]
    fn test_n0inv_property() {
        let key = test_key();
        let n0 = low_u32(key.public_key.n());
        let n0inv = n0inv32(key.public_key.n());
        // n0 * (-(n0^-1)) == -1 mod 2^32
        assert_eq!(n0.wrapping_mul(n0inv), u32::MAX);
    }

    #[test]
    fn test_blob_shape_and_suffix() {
        let key = test_key();
        let blob = key.adb_public_key();

        // Ends with " <name>\0".
        assert_eq!(blob.last(), Some(&0u8));
        let text = std::str::from_utf8(&blob[..blob.len() - 1]).unwrap();
        let (b64, name) = text.split_once(' ').unwrap();
        assert_eq!(name, "unit-test");

        // The base64 part decodes back to the 524-byte structure.
        let raw = BASE64.decode(b64).unwrap();
        assert_eq!(raw.len(), ADB_PUBLIC_KEY_SIZE);
    }

    #[test]
    fn test_blob_is_cached() {
        let key = test_key();
        let a = key.adb_public_key().as_ptr();
        let b = key.adb_public_key().as_ptr();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sign_token_length() {
        let key = test_key();
        let signature = key.sign_token(&[0x42; 20]).unwrap();
        assert_eq!(signature.len(), MODULUS_BYTES);
    }

    #[test]
    fn test_certificate_present() {
        let key = test_key();
        assert!(!key.certificate_der().as_ref().is_empty());
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adbkey");

        let first = KeyMaterial::load_or_create(&path, "roundtrip").unwrap();
        assert!(path.exists());

        let second = KeyMaterial::load_or_create(&path, "roundtrip").unwrap();
        // Same key on disk means the same public key blob.
        assert_eq!(first.adb_public_key(), second.adb_public_key());
    }

    #[test]
    fn test_corrupt_key_file_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adbkey");
        fs::write(&path, b"not a key").unwrap();

        let material = KeyMaterial::load_or_create(&path, "recovered").unwrap();
        // A fresh key was generated and written over the corrupt file.
        let reloaded = KeyMaterial::load_or_create(&path, "recovered").unwrap();
        assert_eq!(material.adb_public_key(), reloaded.adb_public_key());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let out = format!("{:?}", test_key());
        assert!(out.contains("REDACTED"));
        assert!(!out.contains("RsaPrivateKey"));
    }
}
