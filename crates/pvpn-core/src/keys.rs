//! Генерация эфемерных ключевых пар X25519
//!
//! Ключевая пара создаётся на каждую попытку подключения. Публичный ключ
//! вычисляется скалярным умножением базовой точки Curve25519 на приватный
//! ключ. Приватный ключ зануляется при удалении.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Размер ключа X25519 (32 байта)
pub const X25519_KEY_SIZE: usize = 32;

/// Ключевая пара клиента (автоматически зануляется)
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Генерация новой пары из системного CSPRNG
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with(&mut OsRng)
    }

    /// Генерация новой пары из заданного криптографического генератора
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self, CryptoError> {
        let mut bytes = Zeroizing::new([0u8; X25519_KEY_SIZE]);
        rng.try_fill_bytes(&mut bytes[..])
            .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;

        Ok(Self::from_secret_array(*bytes))
    }

    /// Восстановить пару из байтов приватного ключа
    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != X25519_KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: X25519_KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut key_bytes = [0u8; X25519_KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        let pair = Self::from_secret_array(key_bytes);
        key_bytes.zeroize();

        Ok(pair)
    }

    /// Восстановить пару из приватного ключа в base64
    pub fn from_private_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| CryptoError::Decryption("приватный ключ не в base64".into()))?,
        );
        Self::from_private_bytes(&bytes)
    }

    fn from_secret_array(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Байты публичного ключа
    pub fn public_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Публичный ключ в base64 (формат WireGuard)
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Байты приватного ключа; копия зануляется при удалении
    pub fn private_bytes(&self) -> Zeroizing<[u8; X25519_KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Приватный ключ в base64; строка зануляется при удалении
    pub fn private_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(&self.private_bytes()[..]))
    }

    /// Короткий отпечаток публичного ключа для логов (BLAKE3, 8 байт)
    pub fn fingerprint(&self) -> String {
        public_key_fingerprint(&self.public_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.fingerprint())
            .field("private", &"[скрыто]")
            .finish()
    }
}

/// Отпечаток произвольного публичного ключа
pub fn public_key_fingerprint(public: &[u8; X25519_KEY_SIZE]) -> String {
    let hash = blake3::hash(public);
    hex::encode(&hash.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::impls;

    /// Генератор, у которого «закончилась» энтропия
    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            impls::next_u32_via_fill(self)
        }

        fn next_u64(&mut self) -> u64 {
            impls::next_u64_via_fill(self)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
            Err(rand_core::Error::new(std::io::Error::new(
                std::io::ErrorKind::Other,
                "entropy pool closed",
            )))
        }
    }

    impl CryptoRng for BrokenRng {}

    #[test]
    fn test_generate_distinct_pairs() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();

        assert_ne!(a.public_bytes(), b.public_bytes());
        assert_ne!(*a.private_bytes(), *b.private_bytes());
    }

    #[test]
    fn test_public_key_is_scalar_multiplication() {
        let pair = KeyPair::generate().unwrap();
        let expected = x25519_dalek::x25519(*pair.private_bytes(), x25519_dalek::X25519_BASEPOINT_BYTES);
        assert_eq!(pair.public_bytes(), expected);

        // Не хеш приватного ключа
        assert_ne!(pair.public_bytes(), *blake3::hash(&pair.private_bytes()[..]).as_bytes());
    }

    #[test]
    fn test_rfc7748_vector() {
        // RFC 7748, раздел 6.1: ключ Алисы
        let private =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a").unwrap();
        let pair = KeyPair::from_private_bytes(&private).unwrap();
        assert_eq!(
            hex::encode(pair.public_bytes()),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
    }

    #[test]
    fn test_base64_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let restored = KeyPair::from_private_base64(&pair.private_base64()).unwrap();
        assert_eq!(pair.public_base64(), restored.public_base64());
    }

    #[test]
    fn test_invalid_private_size() {
        let result = KeyPair::from_private_bytes(&[1u8; 31]);
        assert_eq!(
            result.unwrap_err(),
            CryptoError::InvalidKeySize {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn test_entropy_failure() {
        let result = KeyPair::generate_with(&mut BrokenRng);
        assert!(matches!(result, Err(CryptoError::EntropyUnavailable(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let pair = KeyPair::generate().unwrap();
        let debug = format!("{:?}", pair);
        assert!(!debug.contains(pair.private_base64().as_str()));
        assert!(debug.contains(&pair.fingerprint()));
    }
}
