//! Конфигурация клиента Prime VPN
//!
//! Этот модуль отвечает за загрузку и валидацию конфигурации клиента.

use pvpn_core::kdf::{KdfAlgorithm, KdfParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::ControllerSettings;
use crate::monitor::MonitorSettings;

/// Конфигурация клиента Prime VPN
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Настройки туннеля
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Настройки мониторинга
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Настройки безопасности
    #[serde(default)]
    pub security: SecurityConfig,

    /// Настройки логирования
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Настройки туннеля
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Таймаут подключения (секунды)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Таймаут отключения (секунды)
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,

    /// Сохранять ключевую пару после отключения для экспорта
    #[serde(default)]
    pub retain_keys_for_export: bool,
}

/// Настройки мониторинга
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Интервал опроса провайдера (секунды)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Таймаут одного опроса (секунды)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Число повторов неудачного опроса
    #[serde(default = "default_max_poll_retries")]
    pub max_poll_retries: u32,

    /// Базовая задержка повтора (миллисекунды)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Keepalive по умолчанию (секунды)
    #[serde(default = "default_keepalive")]
    pub default_keepalive_secs: u64,
}

/// Настройки безопасности
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Алгоритм KDF (argon2id, pbkdf2-sha256)
    #[serde(default = "default_kdf_algorithm")]
    pub kdf_algorithm: KdfAlgorithm,

    /// Память Argon2id (КиБ)
    #[serde(default = "default_kdf_memory")]
    pub kdf_memory_kib: u32,

    /// Проходы Argon2id или итерации PBKDF2
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Параллелизм Argon2id
    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,

    /// Каталог защищённого хранилища
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
}

/// Настройки логирования
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Уровень логирования (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Значения по умолчанию
fn default_connect_timeout() -> u64 {
    30
}

fn default_disconnect_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    3
}

fn default_max_poll_retries() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_keepalive() -> u64 {
    25
}

fn default_kdf_algorithm() -> KdfAlgorithm {
    KdfAlgorithm::Argon2id
}

fn default_kdf_memory() -> u32 {
    KdfParams::argon2id().memory_kib
}

fn default_kdf_iterations() -> u32 {
    KdfParams::argon2id().iterations
}

fn default_kdf_parallelism() -> u32 {
    KdfParams::argon2id().parallelism
}

fn default_storage_dir() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from("C:\\ProgramData\\pvpn-client\\vault")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from(".pvpn/vault")
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            retain_keys_for_export: false,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_timeout_secs: default_poll_timeout(),
            max_poll_retries: default_max_poll_retries(),
            backoff_base_ms: default_backoff_base(),
            default_keepalive_secs: default_keepalive(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            kdf_algorithm: default_kdf_algorithm(),
            kdf_memory_kib: default_kdf_memory(),
            kdf_iterations: default_kdf_iterations(),
            kdf_parallelism: default_kdf_parallelism(),
            storage_dir: default_storage_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Загрузить конфигурацию из TOML файла
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Сохранить конфигурацию в TOML файл
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Валидация конфигурации
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.tunnel.connect_timeout_secs == 0 || self.tunnel.disconnect_timeout_secs == 0 {
            anyhow::bail!("Таймауты туннеля должны быть больше 0");
        }

        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("Интервал опроса должен быть больше 0");
        }

        if self.monitor.poll_timeout_secs == 0
            || self.monitor.poll_timeout_secs > self.monitor.poll_interval_secs
        {
            anyhow::bail!("Таймаут опроса должен быть в диапазоне 1..=poll_interval_secs");
        }

        // Неограниченных повторов не бывает
        if self.monitor.max_poll_retries > 10 {
            anyhow::bail!("max_poll_retries не может быть больше 10");
        }

        if self.monitor.default_keepalive_secs == 0 || self.monitor.default_keepalive_secs > 65535 {
            anyhow::bail!("Keepalive должен быть в диапазоне 1-65535");
        }

        // Проверка параметров KDF
        self.kdf_params().validate()?;

        if self.logging.level.parse::<tracing::Level>().is_err() {
            anyhow::bail!("Неизвестный уровень логирования: {}", self.logging.level);
        }

        Ok(())
    }

    /// Параметры KDF
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            algorithm: self.security.kdf_algorithm,
            memory_kib: self.security.kdf_memory_kib,
            iterations: self.security.kdf_iterations,
            parallelism: self.security.kdf_parallelism,
        }
    }

    /// Настройки мониторинга
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(self.monitor.poll_interval_secs),
            poll_timeout: Duration::from_secs(self.monitor.poll_timeout_secs),
            max_retries: self.monitor.max_poll_retries,
            backoff_base: Duration::from_millis(self.monitor.backoff_base_ms),
            default_keepalive: Duration::from_secs(self.monitor.default_keepalive_secs),
        }
    }

    /// Настройки контроллера
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            connect_timeout: Duration::from_secs(self.tunnel.connect_timeout_secs),
            disconnect_timeout: Duration::from_secs(self.tunnel.disconnect_timeout_secs),
            retain_keys_for_export: self.tunnel.retain_keys_for_export,
            monitor: self.monitor_settings(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kdf_params(), KdfParams::argon2id());
        assert_eq!(config.monitor_settings(), MonitorSettings::default());
        assert_eq!(config.controller_settings(), ControllerSettings::default());
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();

        // Валидная конфигурация
        assert!(config.validate().is_ok());

        // Нулевой интервал опроса
        config.monitor.poll_interval_secs = 0;
        assert!(config.validate().is_err());
        config.monitor.poll_interval_secs = 5;

        // Таймаут больше интервала
        config.monitor.poll_timeout_secs = 10;
        assert!(config.validate().is_err());
        config.monitor.poll_timeout_secs = 3;

        // Слабый KDF
        config.security.kdf_algorithm = KdfAlgorithm::Pbkdf2Sha256;
        config.security.kdf_iterations = 1000;
        assert!(config.validate().is_err());
        config.security.kdf_iterations = 600_000;
        assert!(config.validate().is_ok());

        // Неизвестный уровень логирования
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [tunnel]
            retain_keys_for_export = true

            [security]
            kdf_algorithm = "pbkdf2-sha256"
            kdf_iterations = 200000
            "#,
        )
        .unwrap();

        assert!(config.tunnel.retain_keys_for_export);
        assert_eq!(config.tunnel.connect_timeout_secs, 30);
        assert_eq!(config.monitor.poll_interval_secs, 5);
        assert_eq!(config.kdf_params().algorithm, KdfAlgorithm::Pbkdf2Sha256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");

        let mut config = ClientConfig::default();
        config.monitor.max_poll_retries = 5;
        config.to_file(&path).unwrap();

        let loaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(loaded.monitor.max_poll_retries, 5);
        assert_eq!(loaded.security.storage_dir, config.security.storage_dir);
    }
}
