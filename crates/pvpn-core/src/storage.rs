//! Адаптеры платформенного защищённого хранилища
//!
//! Платформа предоставляет key-value хранилище, зашифрованное на уровне ОС.
//! Ядро пишет в него только готовые [`SecureBlob`](crate::blob::SecureBlob)
//! и соль установки и читает их обратно без изменений.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, VpnError};

/// Key-value хранилище платформы
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Записать значение (заменяя существующее)
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Прочитать значение
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Удалить значение (отсутствие ключа не ошибка)
    async fn delete(&self, key: &str) -> Result<()>;

    /// Список всех ключей
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Хранилище в памяти процесса
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Создать пустое хранилище
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// Хранилище в каталоге: один файл на ключ
///
/// Имя файла: BLAKE3 от ключа (фиксированная длина при любом ключе).
/// Сам ключ хранится в начале файла:
///
/// ```text
/// key_len (4, big-endian) | key (UTF-8) | value
/// ```
///
/// Запись атомарна: сначала временный файл, затем rename.
pub struct FileStorage {
    root: PathBuf,
}

/// Предел длины ключа в заголовке файла
const MAX_KEY_LEN: usize = 64 * 1024;

impl FileStorage {
    /// Открыть (и при необходимости создать) каталог хранилища
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await?;
        }

        debug!("Хранилище открыто: {}", root.display());
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.blob", blake3::hash(key.as_bytes()).to_hex()))
    }

    fn encode(key: &str, value: &[u8]) -> Result<Vec<u8>> {
        if key.len() > MAX_KEY_LEN {
            return Err(VpnError::Storage(format!(
                "ключ длиной {} байт превышает {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        let mut buf = BytesMut::with_capacity(4 + key.len() + value.len());
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_slice(value);
        Ok(buf.to_vec())
    }

    /// Разобрать файл: (ключ, значение)
    fn decode(data: &[u8]) -> Result<(String, Vec<u8>)> {
        let corrupted = || VpnError::Storage("повреждённый файл хранилища".into());

        let mut cursor = data;
        if cursor.remaining() < 4 {
            return Err(corrupted());
        }
        let key_len = cursor.get_u32() as usize;
        if key_len > MAX_KEY_LEN || key_len > cursor.remaining() {
            return Err(corrupted());
        }

        let key = String::from_utf8(cursor[..key_len].to_vec()).map_err(|_| corrupted())?;
        cursor.advance(key_len);
        Ok((key, cursor.to_vec()))
    }

    /// Прочитать только ключ из заголовка файла
    async fn read_key(path: &Path) -> Result<String> {
        let mut file = tokio::fs::File::open(path).await?;

        let key_len = file.read_u32().await? as usize;
        if key_len > MAX_KEY_LEN {
            return Err(VpnError::Storage("повреждённый файл хранилища".into()));
        }

        let mut key = vec![0u8; key_len];
        file.read_exact(&mut key).await?;
        String::from_utf8(key).map_err(|_| VpnError::Storage("повреждённый файл хранилища".into()))
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        tokio::fs::write(&tmp, Self::encode(key, &value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VpnError::Io(e)),
        };

        let (stored_key, value) = Self::decode(&data)?;
        if stored_key != key {
            return Err(VpnError::Storage(format!(
                "файл ключа '{}' содержит другой ключ",
                key
            )));
        }
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VpnError::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("blob") {
                continue;
            }

            match Self::read_key(&path).await {
                Ok(key) => keys.push(key),
                Err(e) => warn!("Пропущен файл {}: {}", path.display(), e),
            }
        }

        Ok(keys)
    }
}
