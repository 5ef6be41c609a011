//! Деривация сессионного ключа из токена аутентификации
//!
//! Ключ получается медленной memory-hard функцией (Argon2id) или итеративным
//! PBKDF2-HMAC-SHA256 над парой (токен, соль установки). Соль генерируется
//! один раз на установку и хранится в защищённом хранилище платформы.

use std::num::NonZeroU32;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::{random_array, SessionKey, CHACHA20_KEY_SIZE};
use crate::error::{CryptoError, Result, VpnError};
use crate::storage::SecureStorage;

/// Размер соли (16 байт)
pub const SALT_SIZE: usize = 16;

/// Ключ, под которым соль установки хранится в платформенном хранилище
pub const INSTALL_SALT_KEY: &str = "pvpn/install-salt";

/// Минимальная длина токена аутентификации
pub const MIN_AUTH_TOKEN_LEN: usize = 32;

/// Минимальный объём памяти Argon2id (8 МиБ)
const ARGON2_MIN_MEMORY_KIB: u32 = 8 * 1024;

/// Минимальное число итераций PBKDF2
const PBKDF2_MIN_ITERATIONS: u32 = 100_000;

/// Алгоритм деривации ключа
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    /// Argon2id (RFC 9106)
    Argon2id,
    /// PBKDF2-HMAC-SHA256
    Pbkdf2Sha256,
}

/// Параметры стоимости KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Алгоритм
    pub algorithm: KdfAlgorithm,
    /// Объём памяти в КиБ (только Argon2id)
    pub memory_kib: u32,
    /// Число проходов (Argon2id) или итераций (PBKDF2)
    pub iterations: u32,
    /// Степень параллелизма (только Argon2id)
    pub parallelism: u32,
}

impl KdfParams {
    /// Argon2id с рекомендованными параметрами (19 МиБ, t=2, p=1)
    pub fn argon2id() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }

    /// PBKDF2-HMAC-SHA256 с 600 000 итераций
    pub fn pbkdf2() -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            memory_kib: 0,
            iterations: 600_000,
            parallelism: 1,
        }
    }

    /// Проверить, что параметры не слабее минимально допустимых
    pub fn validate(&self) -> std::result::Result<(), CryptoError> {
        match self.algorithm {
            KdfAlgorithm::Argon2id => {
                if self.memory_kib < ARGON2_MIN_MEMORY_KIB {
                    return Err(CryptoError::WeakKdfParams(format!(
                        "Argon2id memory {} КиБ < {} КиБ",
                        self.memory_kib, ARGON2_MIN_MEMORY_KIB
                    )));
                }
                if self.iterations == 0 || self.parallelism == 0 {
                    return Err(CryptoError::WeakKdfParams(
                        "Argon2id требует t >= 1 и p >= 1".into(),
                    ));
                }
            }
            KdfAlgorithm::Pbkdf2Sha256 => {
                if self.iterations < PBKDF2_MIN_ITERATIONS {
                    return Err(CryptoError::WeakKdfParams(format!(
                        "PBKDF2 iterations {} < {}",
                        self.iterations, PBKDF2_MIN_ITERATIONS
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id()
    }
}

/// Случайная соль KDF
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Сгенерировать новую соль из системного CSPRNG
    pub fn generate() -> std::result::Result<Self, CryptoError> {
        Ok(Self(random_array(&mut OsRng)?))
    }

    /// Создать из байтов
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CryptoError> {
        let array: [u8; SALT_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeySize {
                    expected: SALT_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Байты соли
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    /// Соль в base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Разбор соли из base64
    pub fn from_base64(encoded: &str) -> std::result::Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| CryptoError::Decryption("соль не в base64".into()))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Salt({})", hex::encode(&self.0[..4]))
    }
}

/// Медленная деривация 32-байтного ключа из секрета и соли
pub fn derive_key(
    secret: &[u8],
    salt: &Salt,
    params: &KdfParams,
) -> std::result::Result<SessionKey, CryptoError> {
    params.validate()?;

    let mut okm = Zeroizing::new([0u8; CHACHA20_KEY_SIZE]);

    match params.algorithm {
        KdfAlgorithm::Argon2id => {
            let argon_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.parallelism,
                Some(CHACHA20_KEY_SIZE),
            )
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
                .hash_password_into(secret, salt.as_bytes(), &mut okm[..])
                .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        }
        KdfAlgorithm::Pbkdf2Sha256 => {
            let iterations = NonZeroU32::new(params.iterations)
                .ok_or_else(|| CryptoError::WeakKdfParams("PBKDF2 iterations = 0".into()))?;

            ring::pbkdf2::derive(
                ring::pbkdf2::PBKDF2_HMAC_SHA256,
                iterations,
                salt.as_bytes(),
                secret,
                &mut okm[..],
            );
        }
    }

    Ok(SessionKey::from_bytes(&okm))
}

/// Деривация сессионного ключа из токена аутентификации
pub struct SessionKeyDerivation {
    salt: Salt,
    params: KdfParams,
}

impl SessionKeyDerivation {
    /// Создать с уже известной солью
    pub fn new(salt: Salt, params: KdfParams) -> std::result::Result<Self, CryptoError> {
        params.validate()?;
        Ok(Self { salt, params })
    }

    /// Загрузить соль установки из хранилища или создать и сохранить новую
    pub async fn load_or_create(
        storage: Arc<dyn SecureStorage>,
        params: KdfParams,
    ) -> Result<Self> {
        params.validate()?;

        let salt = match storage.get(INSTALL_SALT_KEY).await? {
            Some(bytes) => {
                debug!("Соль установки загружена из хранилища");
                Salt::from_bytes(&bytes)?
            }
            None => {
                let salt = Salt::generate()?;
                storage.set(INSTALL_SALT_KEY, salt.as_bytes().to_vec()).await?;
                info!("Создана новая соль установки");
                salt
            }
        };

        Ok(Self { salt, params })
    }

    /// Соль установки
    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    /// Параметры KDF
    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Вывести сессионный ключ из токена
    ///
    /// Детерминирована для одного и того же токена и соли.
    pub fn derive(&self, auth_token: &str) -> std::result::Result<SessionKey, CryptoError> {
        if auth_token.len() < MIN_AUTH_TOKEN_LEN {
            return Err(CryptoError::InvalidAuthToken {
                min_len: MIN_AUTH_TOKEN_LEN,
            });
        }

        let key = derive_key(auth_token.as_bytes(), &self.salt, &self.params)?;
        debug!("Сессионный ключ выведен ({:?})", self.params.algorithm);
        Ok(key)
    }

    /// Асинхронная деривация в blocking-пуле tokio
    pub async fn derive_blocking(&self, auth_token: Zeroizing<String>) -> Result<SessionKey> {
        let salt = self.salt;
        let params = self.params;

        if auth_token.len() < MIN_AUTH_TOKEN_LEN {
            return Err(CryptoError::InvalidAuthToken {
                min_len: MIN_AUTH_TOKEN_LEN,
            }
            .into());
        }

        let key = tokio::task::spawn_blocking(move || {
            derive_key(auth_token.as_bytes(), &salt, &params)
        })
        .await
        .map_err(|e| VpnError::Crypto(CryptoError::KeyDerivation(e.to_string())))??;

        Ok(key)
    }
}

/// Быстрые, но допустимые параметры для тестов
#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        algorithm: KdfAlgorithm::Argon2id,
        memory_kib: ARGON2_MIN_MEMORY_KIB,
        iterations: 1,
        parallelism: 1,
    }
}
