//! # Prime VPN Core (pvpn-core)
//!
//! Ядро менеджера туннельных сессий и защищённого хранилища секретов.
//!
//! ## Возможности
//!
//! - **Ключи**: эфемерные пары X25519 на каждое подключение, Zeroize
//! - **Валидация**: разбор недоверенной конфигурации пира в закрытый тип
//! - **KDF**: Argon2id / PBKDF2-HMAC-SHA256 над токеном и солью установки
//! - **Хранилище**: ChaCha20-Poly1305 со свежим nonce на каждую запись
//! - **Сессии**: таблица переходов жизненного цикла туннеля
//!
//! ## Структура
//!
//! - [`keys`]: Генерация ключевых пар
//! - [`peer`]: Валидация конфигурации пира
//! - [`kdf`]: Деривация сессионного ключа
//! - [`crypto`]: AEAD и HKDF примитивы
//! - [`blob`]: Формат зашифрованного контейнера
//! - [`storage`]: Адаптеры платформенного хранилища
//! - [`vault`]: Защищённое хранилище секретов
//! - [`session`]: Состояния туннеля и активная сессия
//! - [`error`]: Типы ошибок
//!
//! ## Пример использования
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pvpn_core::{
//!     kdf::{KdfParams, SessionKeyDerivation},
//!     storage::{MemoryStorage, SecureStorage},
//!     vault::SecureVault,
//!     KeyPair, PeerConfig,
//! };
//!
//! # async fn example(raw: &str, token: &str) -> pvpn_core::Result<()> {
//! let peer = PeerConfig::parse(raw)?;
//! let key_pair = KeyPair::generate()?;
//! let wg_quick = peer.to_wg_quick(&key_pair);
//!
//! let storage: Arc<dyn SecureStorage> = Arc::new(MemoryStorage::new());
//! let kdf = SessionKeyDerivation::load_or_create(storage.clone(), KdfParams::default()).await?;
//! let session_key = kdf.derive(token)?;
//!
//! let vault = SecureVault::with_key(storage, &session_key)?;
//! vault.put("vpn_config", wg_quick.as_bytes()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod crypto;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod peer;
pub mod session;
pub mod storage;
pub mod vault;

// Re-экспорт основных типов для удобства
pub use blob::SecureBlob;
pub use crypto::SessionKey;
pub use error::{CryptoError, ProviderError, Result, StateError, ValidationError, VpnError};
pub use keys::KeyPair;
pub use peer::PeerConfig;
pub use session::{SessionMetrics, TunnelSession, TunnelState};
pub use vault::SecureVault;

/// Версия библиотеки
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
