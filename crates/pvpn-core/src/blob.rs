//! Зашифрованный контейнер SecureBlob
//!
//! Формат для платформенного хранилища (big-endian):
//!
//! ```text
//! magic "PVB" (3) | format (1) | algorithm_id (1) | created_at_ms (8)
//! nonce (12) | integrity_tag (16) | ciphertext_len (4) | ciphertext
//! ```
//!
//! Для экспорта тот же контейнер сериализуется в JSON (поля в base64).
//! Идентификатор алгоритма и время создания входят в AAD, поэтому их
//! подмена обнаруживается так же, как подмена шифротекста.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{AeadCipher, AlgorithmId, Sealed, CHACHA20_NONCE_SIZE, POLY1305_TAG_SIZE};
use crate::error::{CryptoError, Result};

/// Магическая последовательность контейнера
const BLOB_MAGIC: &[u8; 3] = b"PVB";

/// Версия бинарного формата
const BLOB_FORMAT_VERSION: u8 = 1;

/// Размер заголовка бинарного формата
const BLOB_HEADER_SIZE: usize = 3 + 1 + 1 + 8 + CHACHA20_NONCE_SIZE + POLY1305_TAG_SIZE + 4;

/// Максимальный размер шифротекста (1 МиБ)
const MAX_CIPHERTEXT_SIZE: usize = 1024 * 1024;

/// Максимальный размер открытых данных; tag хранится отдельно,
/// поэтому шифротекст той же длины
pub const MAX_PLAINTEXT_SIZE: usize = MAX_CIPHERTEXT_SIZE;

/// Зашифрованный секрет; неизменяем после создания
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureBlob {
    /// Идентификатор AEAD алгоритма
    #[serde(with = "algorithm_name")]
    pub algorithm_id: AlgorithmId,
    /// Nonce
    #[serde(with = "b64")]
    pub nonce: [u8; CHACHA20_NONCE_SIZE],
    /// Шифротекст
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Auth tag
    #[serde(with = "b64")]
    pub integrity_tag: [u8; POLY1305_TAG_SIZE],
    /// Время создания (точность до миллисекунд)
    pub created_at: DateTime<Utc>,
}

impl SecureBlob {
    /// Зашифровать данные в новый контейнер
    ///
    /// # Параметры
    /// - `context`: Контекст, связывающий контейнер с местом хранения
    ///   (например, имя записи); входит в AAD
    pub fn seal(cipher: &AeadCipher, plaintext: &[u8], context: &[u8]) -> Result<Self> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(CryptoError::PayloadTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT_SIZE,
            }
            .into());
        }

        let algorithm_id = AlgorithmId::ChaCha20Poly1305;
        let created_at = now_millis();
        let aad = Self::aad(context, algorithm_id, &created_at);

        let sealed = cipher.seal(plaintext, &aad)?;

        Ok(Self {
            algorithm_id,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            integrity_tag: sealed.tag,
            created_at,
        })
    }

    /// Расшифровать контейнер
    pub fn open(&self, cipher: &AeadCipher, context: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let aad = Self::aad(context, self.algorithm_id, &self.created_at);
        let sealed = Sealed {
            nonce: self.nonce,
            ciphertext: self.ciphertext.clone(),
            tag: self.integrity_tag,
        };
        cipher.open(&sealed, &aad)
    }

    fn aad(context: &[u8], algorithm_id: AlgorithmId, created_at: &DateTime<Utc>) -> Vec<u8> {
        let mut aad = Vec::with_capacity(context.len() + 9);
        aad.extend_from_slice(context);
        aad.push(algorithm_id as u8);
        aad.extend_from_slice(&created_at.timestamp_millis().to_be_bytes());
        aad
    }

    /// Сериализовать в бинарный формат
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOB_HEADER_SIZE + self.ciphertext.len());
        buf.put_slice(BLOB_MAGIC);
        buf.put_u8(BLOB_FORMAT_VERSION);
        buf.put_u8(self.algorithm_id as u8);
        buf.put_i64(self.created_at.timestamp_millis());
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.integrity_tag);
        buf.put_u32(self.ciphertext.len() as u32);
        buf.put_slice(&self.ciphertext);
        buf.freeze()
    }

    /// Десериализовать из бинарного формата
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, CryptoError> {
        if data.len() < BLOB_HEADER_SIZE {
            return Err(CryptoError::Decryption(format!(
                "контейнер короче заголовка: {} < {}",
                data.len(),
                BLOB_HEADER_SIZE
            )));
        }

        let mut cursor = data;

        let mut magic = [0u8; 3];
        cursor.copy_to_slice(&mut magic);
        if &magic != BLOB_MAGIC {
            return Err(CryptoError::Decryption("неизвестная сигнатура контейнера".into()));
        }

        let format = cursor.get_u8();
        if format != BLOB_FORMAT_VERSION {
            return Err(CryptoError::Decryption(format!(
                "неподдерживаемая версия контейнера: {}",
                format
            )));
        }

        let algorithm_id = AlgorithmId::from_u8(cursor.get_u8())?;

        let created_ms = cursor.get_i64();
        let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms)
            .ok_or_else(|| CryptoError::Decryption("некорректное время создания".into()))?;

        let mut nonce = [0u8; CHACHA20_NONCE_SIZE];
        cursor.copy_to_slice(&mut nonce);

        let mut integrity_tag = [0u8; POLY1305_TAG_SIZE];
        cursor.copy_to_slice(&mut integrity_tag);

        let ciphertext_len = cursor.get_u32() as usize;
        if ciphertext_len > MAX_CIPHERTEXT_SIZE {
            return Err(CryptoError::Decryption(format!(
                "шифротекст {} байт превышает максимум {}",
                ciphertext_len, MAX_CIPHERTEXT_SIZE
            )));
        }
        if ciphertext_len != cursor.remaining() {
            return Err(CryptoError::Decryption(format!(
                "некорректная длина шифротекста: заявлено {}, доступно {}",
                ciphertext_len,
                cursor.remaining()
            )));
        }

        Ok(Self {
            algorithm_id,
            nonce,
            ciphertext: cursor.to_vec(),
            integrity_tag,
            created_at,
        })
    }
}

/// Текущее время, усечённое до миллисекунд
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(
        value: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(value.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: TryFrom<Vec<u8>>,
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(encoded).map_err(D::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| D::Error::custom(format!("неверная длина поля: {}", len)))
    }
}

mod algorithm_name {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::crypto::AlgorithmId;

    pub fn serialize<S: Serializer>(value: &AlgorithmId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<AlgorithmId, D::Error> {
        let name = String::deserialize(deserializer)?;
        AlgorithmId::from_name(&name).map_err(D::Error::custom)
    }
}
