//! # Prime VPN Client Library
//!
//! Клиентская библиотека менеджера туннельных сессий Prime VPN.
//!
//! Предоставляет API для:
//! - Подключения и отключения туннеля через платформенного провайдера
//! - Мониторинга состояния туннеля
//! - Хранения секретов и экспорта сессии
//!
//! [`VpnClient`] собирает все компоненты из явно переданных зависимостей;
//! глобального состояния нет, провайдер и хранилище подменяются в тестах.

pub mod config;
pub mod controller;
pub mod monitor;
pub mod porter;
pub mod provider;

pub use config::ClientConfig;
pub use controller::{ControllerSettings, SessionInfo, TunnelController};
pub use monitor::{MonitorSettings, StatsMonitor};
pub use porter::{ConfigPorter, ExportBundle, ImportedSession};
pub use provider::{SimulatedProvider, TunnelProvider};

use std::sync::Arc;

use pvpn_core::kdf::SessionKeyDerivation;
use pvpn_core::storage::SecureStorage;
use pvpn_core::{PeerConfig, Result, SecureVault, TunnelState, VpnError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Имя записи с токеном аутентификации
pub const AUTH_TOKEN_ENTRY: &str = "auth_token";

/// Имя записи с последней конфигурацией пира
pub const PEER_CONFIG_ENTRY: &str = "vpn_config";

/// VPN клиент: владеет контроллером, хранилищем и портером
pub struct VpnClient {
    /// Конфигурация
    config: Arc<ClientConfig>,
    /// Контроллер туннеля
    controller: TunnelController,
    /// Хранилище секретов
    vault: Arc<SecureVault>,
    /// Деривация сессионного ключа
    kdf: SessionKeyDerivation,
    /// Экспорт и импорт
    porter: ConfigPorter,
    /// Сериализует login/logout
    auth: Mutex<()>,
}

impl VpnClient {
    /// Создать клиента
    ///
    /// Соль установки загружается из хранилища (или создаётся при первом
    /// запуске). Хранилище остаётся заблокированным до [`VpnClient::login`].
    pub async fn new(
        config: ClientConfig,
        storage: Arc<dyn SecureStorage>,
        provider: Arc<dyn TunnelProvider>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let kdf_params = config.kdf_params();

        let kdf = SessionKeyDerivation::load_or_create(Arc::clone(&storage), kdf_params).await?;
        let vault = Arc::new(SecureVault::new(storage));
        let controller = TunnelController::new(provider, config.controller_settings());
        let porter = ConfigPorter::new(controller.clone(), Arc::clone(&vault), kdf_params);

        Ok(Self {
            config,
            controller,
            vault,
            kdf,
            porter,
            auth: Mutex::new(()),
        })
    }

    /// Войти: вывести сессионный ключ из токена и разблокировать хранилище
    ///
    /// При смене токена существующие записи перешифровываются новым ключом.
    pub async fn login(&self, auth_token: Zeroizing<String>) -> Result<()> {
        let _auth = self.auth.lock().await;

        let token_bytes = Zeroizing::new(auth_token.as_bytes().to_vec());
        let session_key = self.kdf.derive_blocking(auth_token).await?;

        if self.vault.is_unlocked().await {
            let count = self.vault.rekey(&session_key).await?;
            info!("Токен обновлён, перешифровано записей: {}", count);
        } else {
            self.vault.unlock(&session_key).await?;
            info!("Вход выполнен");
        }

        self.vault.put(AUTH_TOKEN_ENTRY, &token_bytes).await?;
        Ok(())
    }

    /// Выйти: закрыть туннель, удалить секреты и занулить ключи
    pub async fn logout(&self) -> Result<()> {
        let _auth = self.auth.lock().await;

        if let Err(e) = self.controller.shutdown().await {
            warn!("Ошибка закрытия туннеля при выходе: {}", e);
        }
        self.vault.clear().await?;

        info!("Выход выполнен, секреты удалены");
        Ok(())
    }

    /// Подключиться по сырой конфигурации пира
    pub async fn connect(&self, raw_config: &str) -> Result<SessionInfo> {
        let info = self.controller.connect(raw_config).await?;
        self.cache_peer_config().await;
        Ok(info)
    }

    /// Подключиться по конфигурации, сохранённой в хранилище
    pub async fn reconnect_cached(&self) -> Result<SessionInfo> {
        let peer = self.cached_peer_config().await?;
        self.controller.connect(&peer.serialize()).await
    }

    /// Отключиться
    pub async fn disconnect(&self) -> Result<()> {
        self.controller.disconnect().await
    }

    /// Сбросить состояние после сбоя
    pub async fn reset(&self) -> Result<()> {
        self.controller.reset().await
    }

    /// Снимок текущей сессии
    pub async fn status(&self) -> SessionInfo {
        self.controller.snapshot().await
    }

    /// Сохранённая конфигурация пира (проходит валидацию заново)
    pub async fn cached_peer_config(&self) -> Result<PeerConfig> {
        let raw = self.vault.get(PEER_CONFIG_ENTRY).await?;
        let text = std::str::from_utf8(&raw).map_err(|_| VpnError::Storage(
            "сохранённая конфигурация не в UTF-8".into(),
        ))?;
        Ok(PeerConfig::parse(text)?)
    }

    async fn cache_peer_config(&self) {
        if !self.vault.is_unlocked().await {
            debug!("Хранилище заблокировано, конфигурация не кешируется");
            return;
        }

        let Some((_, peer)) = self.controller.export_material().await else {
            return;
        };
        if let Err(e) = self.vault.put(PEER_CONFIG_ENTRY, peer.serialize().as_bytes()).await {
            warn!("Не удалось сохранить конфигурацию пира: {}", e);
        }
    }

    /// Текущее состояние туннеля
    pub async fn state(&self) -> TunnelState {
        self.controller.state().await
    }

    /// Конфигурация
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Контроллер туннеля
    pub fn controller(&self) -> &TunnelController {
        &self.controller
    }

    /// Хранилище секретов
    pub fn vault(&self) -> &Arc<SecureVault> {
        &self.vault
    }

    /// Экспорт и импорт
    pub fn porter(&self) -> &ConfigPorter {
        &self.porter
    }
}
