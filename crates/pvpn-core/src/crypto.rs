//! Криптографические примитивы для хранилища и экспорта
//!
//! Этот модуль предоставляет обёртки над криптографическими операциями:
//! - ChaCha20-Poly1305: AEAD шифрование со случайным nonce на каждый вызов
//! - HKDF-SHA256: разделение сессионного ключа на ключи по назначению
//!
//! Все секретные данные автоматически зануляются при удалении (Zeroize).

use std::fmt;

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce, Tag,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, Result, VpnError};

/// Размер ключа ChaCha20 (32 байта)
pub const CHACHA20_KEY_SIZE: usize = 32;

/// Размер nonce для ChaCha20-Poly1305 (12 байт)
pub const CHACHA20_NONCE_SIZE: usize = 12;

/// Размер auth tag Poly1305 (16 байт)
pub const POLY1305_TAG_SIZE: usize = 16;

/// Контекст HKDF для ключа хранилища
pub const VAULT_KEY_INFO: &[u8] = b"pvpn-vault-key-v1";

/// Контекст HKDF для ключа экспорта
pub const EXPORT_KEY_INFO: &[u8] = b"pvpn-export-key-v1";

/// Идентификатор AEAD алгоритма
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AlgorithmId {
    /// ChaCha20-Poly1305 (RFC 8439)
    ChaCha20Poly1305 = 1,
}

impl AlgorithmId {
    /// Преобразование из u8
    pub fn from_u8(value: u8) -> std::result::Result<Self, CryptoError> {
        match value {
            1 => Ok(AlgorithmId::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedAlgorithm(format!("id {}", other))),
        }
    }

    /// Каноническое имя алгоритма
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmId::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Разбор канонического имени
    pub fn from_name(name: &str) -> std::result::Result<Self, CryptoError> {
        match name {
            "chacha20-poly1305" => Ok(AlgorithmId::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Симметричный ключ (автоматически зануляется)
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; CHACHA20_KEY_SIZE],
}

impl SessionKey {
    /// Создать из байтов
    pub fn from_bytes(bytes: &[u8; CHACHA20_KEY_SIZE]) -> Self {
        Self { bytes: *bytes }
    }

    /// Получить байты ключа
    pub fn as_bytes(&self) -> &[u8; CHACHA20_KEY_SIZE] {
        &self.bytes
    }

    /// Ключ по назначению через HKDF-SHA256
    ///
    /// # Параметры
    /// - `info`: Контекст назначения (например, [`VAULT_KEY_INFO`])
    pub fn subkey(&self, info: &[u8]) -> std::result::Result<SessionKey, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);

        let mut okm = Zeroizing::new([0u8; CHACHA20_KEY_SIZE]);
        hkdf.expand(info, &mut okm[..])
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(SessionKey::from_bytes(&okm))
    }

    /// Генерация случайного ключа
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; CHACHA20_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([скрыто])")
    }
}

/// Результат AEAD шифрования с отделённым auth tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Nonce, использованный для шифрования
    pub nonce: [u8; CHACHA20_NONCE_SIZE],
    /// Шифротекст (той же длины, что и открытый текст)
    pub ciphertext: Vec<u8>,
    /// Auth tag Poly1305
    pub tag: [u8; POLY1305_TAG_SIZE],
}

/// AEAD шифровальщик (ChaCha20-Poly1305)
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    /// Создать новый шифровальщик
    pub fn new(key: &SessionKey) -> Self {
        let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
        Self { cipher }
    }

    /// Зашифровать данные со свежим случайным nonce
    ///
    /// # Параметры
    /// - `plaintext`: Открытые данные для шифрования
    /// - `aad`: Дополнительные аутентифицированные данные
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
        self.seal_with(&mut OsRng, plaintext, aad)
    }

    /// Зашифровать данные, взяв nonce из заданного генератора
    pub fn seal_with<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Sealed> {
        let mut nonce = [0u8; CHACHA20_NONCE_SIZE];
        rng.try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;

        let mut tag_bytes = [0u8; POLY1305_TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(Sealed {
            nonce,
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    /// Расшифровать данные
    ///
    /// Несовпадение auth tag возвращает [`VpnError::Integrity`]; открытый
    /// текст при этом не возвращается ни частично, ни полностью.
    pub fn open(&self, sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let mut buffer = Zeroizing::new(sealed.ciphertext.clone());

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.nonce),
                aad,
                &mut buffer[..],
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| VpnError::Integrity)?;

        Ok(buffer)
    }
}

/// Генерация случайного массива фиксированного размера
pub fn random_array<R: RngCore + CryptoRng, const N: usize>(
    rng: &mut R,
) -> std::result::Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::EntropyUnavailable(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = SessionKey::random(&mut OsRng);
        let cipher = AeadCipher::new(&key);

        let plaintext = b"Hello, Prime VPN!";
        let aad = b"additional authenticated data";

        let sealed = cipher.seal(plaintext, aad).unwrap();
        assert_eq!(sealed.ciphertext.len(), plaintext.len());
        assert_ne!(&sealed.ciphertext[..], plaintext);

        let opened = cipher.open(&sealed, aad).unwrap();
        assert_eq!(&opened[..], plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = SessionKey::random(&mut OsRng);
        let cipher = AeadCipher::new(&key);

        let a = cipher.seal(b"same", b"").unwrap();
        let b = cipher.seal(b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_aad() {
        let key = SessionKey::random(&mut OsRng);
        let cipher = AeadCipher::new(&key);

        let sealed = cipher.seal(b"secret", b"correct aad").unwrap();
        let result = cipher.open(&sealed, b"wrong aad");
        assert!(matches!(result, Err(VpnError::Integrity)));
    }

    #[test]
    fn test_wrong_key() {
        let cipher1 = AeadCipher::new(&SessionKey::random(&mut OsRng));
        let cipher2 = AeadCipher::new(&SessionKey::random(&mut OsRng));

        let sealed = cipher1.seal(b"secret", b"aad").unwrap();
        assert!(matches!(cipher2.open(&sealed, b"aad"), Err(VpnError::Integrity)));
    }

    #[test]
    fn test_tampered_tag() {
        let cipher = AeadCipher::new(&SessionKey::random(&mut OsRng));
        let mut sealed = cipher.seal(b"secret", b"aad").unwrap();
        sealed.tag[0] ^= 0x01;
        assert!(matches!(cipher.open(&sealed, b"aad"), Err(VpnError::Integrity)));
    }

    #[test]
    fn test_subkeys_are_separated() {
        let key = SessionKey::random(&mut OsRng);
        let vault = key.subkey(VAULT_KEY_INFO).unwrap();
        let export = key.subkey(EXPORT_KEY_INFO).unwrap();

        assert_ne!(vault.as_bytes(), export.as_bytes());
        assert_ne!(vault.as_bytes(), key.as_bytes());
        assert_eq!(vault.as_bytes(), key.subkey(VAULT_KEY_INFO).unwrap().as_bytes());
    }

    #[test]
    fn test_algorithm_id() {
        assert_eq!(AlgorithmId::from_u8(1).unwrap(), AlgorithmId::ChaCha20Poly1305);
        assert!(AlgorithmId::from_u8(7).is_err());
        assert_eq!(
            AlgorithmId::from_name("chacha20-poly1305").unwrap(),
            AlgorithmId::ChaCha20Poly1305
        );
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SessionKey::from_bytes(&[0xAB; 32]);
        assert!(!format!("{:?}", key).contains("ab"));
    }
}
