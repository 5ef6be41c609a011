//! Защищённое хранилище секретов (SecureVault)
//!
//! Каждая запись шифруется ChaCha20-Poly1305 под ключом хранилища, который
//! выводится через HKDF из текущего сессионного ключа. Для каждого вызова
//! `put` берётся свежий случайный nonce. Имя записи входит в AAD, поэтому
//! перестановка контейнеров между записями обнаруживается.
//!
//! Операции над одним именем сериализуются, над разными именами идут
//! параллельно. `clear` и `rekey` берут эксклюзивный доступ ко всему хранилищу.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::blob::SecureBlob;
use crate::crypto::{AeadCipher, SessionKey, VAULT_KEY_INFO};
use crate::error::{CryptoError, Result, VpnError};
use crate::storage::SecureStorage;

/// Префикс записей хранилища в платформенном key-value
const VAULT_PREFIX: &str = "vault/";

/// Ключ хранилища вместе с готовым шифровальщиком
struct VaultKey {
    /// Ключ хранилища (зануляется при удалении)
    _key: SessionKey,
    cipher: AeadCipher,
}

impl VaultKey {
    fn from_session_key(session_key: &SessionKey) -> std::result::Result<Self, CryptoError> {
        let key = session_key.subkey(VAULT_KEY_INFO)?;
        let cipher = AeadCipher::new(&key);
        Ok(Self { _key: key, cipher })
    }
}

/// Защищённое хранилище секретов
pub struct SecureVault {
    /// Платформенное хранилище
    storage: Arc<dyn SecureStorage>,
    /// Текущий ключ (None, если хранилище заблокировано)
    key: RwLock<Option<VaultKey>>,
    /// Эксклюзивный доступ для clear/rekey
    gate: RwLock<()>,
    /// Блокировки по именам записей
    entry_locks: EntryLocks,
}

impl SecureVault {
    /// Создать заблокированное хранилище
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self {
            storage,
            key: RwLock::new(None),
            gate: RwLock::new(()),
            entry_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Создать и сразу разблокировать хранилище
    pub fn with_key(
        storage: Arc<dyn SecureStorage>,
        session_key: &SessionKey,
    ) -> std::result::Result<Self, CryptoError> {
        let mut vault = Self::new(storage);
        vault.key = RwLock::new(Some(VaultKey::from_session_key(session_key)?));
        Ok(vault)
    }

    /// Разблокировать хранилище сессионным ключом
    ///
    /// Предыдущий ключ (если был) зануляется. Существующие записи не
    /// перешифровываются, для смены токена используйте [`SecureVault::rekey`].
    pub async fn unlock(&self, session_key: &SessionKey) -> Result<()> {
        let vault_key = VaultKey::from_session_key(session_key)?;
        *self.key.write().await = Some(vault_key);
        debug!("Хранилище разблокировано");
        Ok(())
    }

    /// Заблокировать хранилище, занулив ключ
    pub async fn lock(&self) {
        self.key.write().await.take();
        debug!("Хранилище заблокировано");
    }

    /// Разблокировано ли хранилище
    pub async fn is_unlocked(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Зашифровать и сохранить секрет
    pub async fn put(&self, name: &str, plaintext: &[u8]) -> Result<()> {
        let _gate = self.gate.read().await;
        let _entry = self.lock_entry(name).await;

        let blob = {
            let key = self.key.read().await;
            let key = key.as_ref().ok_or(CryptoError::VaultLocked)?;
            SecureBlob::seal(&key.cipher, plaintext, name.as_bytes())?
        };

        self.storage
            .set(&storage_key(name), blob.to_bytes().to_vec())
            .await?;

        debug!("Запись '{}' сохранена ({} байт)", name, plaintext.len());
        Ok(())
    }

    /// Прочитать и расшифровать секрет
    pub async fn get(&self, name: &str) -> Result<Zeroizing<Vec<u8>>> {
        let _gate = self.gate.read().await;
        let _entry = self.lock_entry(name).await;

        let raw = self
            .storage
            .get(&storage_key(name))
            .await?
            .ok_or_else(|| VpnError::NotFound {
                name: name.to_string(),
            })?;

        let blob = SecureBlob::from_bytes(&raw)?;

        let key = self.key.read().await;
        let key = key.as_ref().ok_or(CryptoError::VaultLocked)?;

        blob.open(&key.cipher, name.as_bytes()).map_err(|e| {
            if matches!(e, VpnError::Integrity) {
                warn!("Запись '{}' не прошла проверку целостности", name);
            }
            e
        })
    }

    /// Удалить запись (отсутствие записи не ошибка)
    pub async fn remove(&self, name: &str) -> Result<()> {
        let _gate = self.gate.read().await;
        let _entry = self.lock_entry(name).await;

        self.storage.delete(&storage_key(name)).await
    }

    /// Есть ли запись с таким именем
    pub async fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.storage.get(&storage_key(name)).await?.is_some())
    }

    /// Имена всех записей
    pub async fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(VAULT_PREFIX).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Удалить все записи и занулить ключ
    pub async fn clear(&self) -> Result<()> {
        let _gate = self.gate.write().await;

        let mut removed = 0usize;
        for key in self.storage.keys().await? {
            if key.starts_with(VAULT_PREFIX) {
                self.storage.delete(&key).await?;
                removed += 1;
            }
        }

        self.key.write().await.take();

        info!("Хранилище очищено: удалено {} записей", removed);
        Ok(())
    }

    /// Перешифровать все записи под новым сессионным ключом
    ///
    /// Используется при смене токена аутентификации. Если хотя бы одна
    /// запись не расшифровывается текущим ключом, ничего не меняется.
    /// Если запись в платформенное хранилище не удалась, уже записанные
    /// контейнеры возвращаются к прежнему виду, ключ остаётся старым.
    pub async fn rekey(&self, new_session_key: &SessionKey) -> Result<usize> {
        let _gate = self.gate.write().await;
        let new_key = VaultKey::from_session_key(new_session_key)?;

        let mut key_guard = self.key.write().await;
        let old_key = key_guard.as_ref().ok_or(CryptoError::VaultLocked)?;

        let mut reencrypted = Vec::new();
        for key in self.storage.keys().await? {
            let Some(name) = key.strip_prefix(VAULT_PREFIX) else {
                continue;
            };
            let Some(raw) = self.storage.get(&key).await? else {
                continue;
            };

            let plaintext = SecureBlob::from_bytes(&raw)?.open(&old_key.cipher, name.as_bytes())?;
            let blob = SecureBlob::seal(&new_key.cipher, &plaintext, name.as_bytes())?;
            reencrypted.push((key.clone(), raw, blob));
        }

        let count = reencrypted.len();
        for (written, (key, _, blob)) in reencrypted.iter().enumerate() {
            if let Err(e) = self.storage.set(key, blob.to_bytes().to_vec()).await {
                error!("Перешифровка прервана на записи {}: {}", written + 1, e);
                self.restore(&reencrypted[..written]).await;
                return Err(e);
            }
        }

        *key_guard = Some(new_key);
        info!("Хранилище перешифровано: {} записей", count);
        Ok(count)
    }

    /// Вернуть прежние контейнеры после неудачной перешифровки
    async fn restore(&self, written: &[(String, Vec<u8>, SecureBlob)]) {
        for (key, original, _) in written {
            if let Err(e) = self.storage.set(key, original.clone()).await {
                error!("Не удалось восстановить запись '{}': {}", key, e);
            }
        }
    }

    async fn lock_entry<'a>(&'a self, name: &'a str) -> EntryGuard<'a> {
        let entry = {
            let mut locks = lock_table(&self.entry_locks);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        let guard = Arc::clone(&entry).lock_owned().await;

        EntryGuard {
            locks: &self.entry_locks,
            name,
            entry,
            guard: Some(guard),
        }
    }
}

type EntryLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

fn lock_table(locks: &EntryLocks) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    match locks.lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Блокировка записи; при освобождении неиспользуемая блокировка удаляется
struct EntryGuard<'a> {
    locks: &'a EntryLocks,
    name: &'a str,
    entry: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = lock_table(self.locks);
        // Ссылки есть только у таблицы и у нас: ожидающих нет
        let unused = locks
            .get(self.name)
            .is_some_and(|e| Arc::ptr_eq(e, &self.entry) && Arc::strong_count(e) == 2);
        if unused {
            locks.remove(self.name);
        }
    }
}

fn storage_key(name: &str) -> String {
    format!("{}{}", VAULT_PREFIX, name)
}
