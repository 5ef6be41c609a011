//! Контроллер жизненного цикла туннеля
//!
//! Этот модуль отвечает за:
//! - Подключение: валидация, генерация ключей, вызов провайдера
//! - Отключение и сброс после сбоя
//! - Запуск и синхронную остановку StatsMonitor
//! - Публикацию состояния через `watch` канал
//!
//! Все переходы выполняются под одним мьютексом. Вызовы провайдера идут вне
//! мьютекса, а их результат применяется, только если сессия та же и всё ещё
//! находится в ожидаемом состоянии.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pvpn_core::session::{SessionMetrics, TunnelEvent, TunnelSession, TunnelState};
use pvpn_core::{KeyPair, PeerConfig, Result, StateError, VpnError};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::monitor::{MonitorOutcome, MonitorSettings, StatsMonitor};
use crate::provider::TunnelProvider;

/// Настройки контроллера
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Тайм-аут подключения провайдера
    pub connect_timeout: Duration,
    /// Тайм-аут закрытия туннеля
    pub disconnect_timeout: Duration,
    /// Сохранять ключи после отключения для экспорта
    pub retain_keys_for_export: bool,
    /// Настройки мониторинга
    pub monitor: MonitorSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            retain_keys_for_export: false,
            monitor: MonitorSettings::default(),
        }
    }
}

/// Снимок сессии без секретов
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Идентификатор сессии
    pub session_id: Option<u64>,
    /// Состояние туннеля
    pub state: TunnelState,
    /// Публичный ключ клиента (base64)
    pub client_public_key: Option<String>,
    /// Endpoint пира
    pub endpoint: Option<String>,
    /// Время подключения
    pub started_at: Option<DateTime<Utc>>,
    /// Время последнего handshake
    pub last_handshake: Option<DateTime<Utc>>,
    /// Метрики
    pub metrics: Option<SessionMetrics>,
    /// Последняя ошибка
    pub last_error: Option<String>,
}

/// Материал для экспорта: ключевая пара и конфигурация пира
pub type ExportMaterial = (Arc<KeyPair>, PeerConfig);

/// Сессия вместе с её задачами
struct ActiveSession {
    session: TunnelSession,
    /// Отменяет незавершённый connect и монитор
    cancel: CancellationToken,
    metrics_rx: Option<watch::Receiver<SessionMetrics>>,
}

impl ActiveSession {
    fn sync_metrics(&mut self) {
        if let Some(rx) = &self.metrics_rx {
            let metrics = rx.borrow().clone();
            self.session.update_metrics(metrics);
        }
    }

    /// Остановить монитор и незавершённые вызовы; синхронно с переходом
    fn stop_tasks(&mut self) {
        self.cancel.cancel();
        self.sync_metrics();
        self.metrics_rx = None;
    }
}

#[derive(Default)]
struct ControllerState {
    active: Option<ActiveSession>,
    retained: Option<ExportMaterial>,
    last_error: Option<String>,
}

impl ControllerState {
    fn tunnel_state(&self) -> TunnelState {
        self.active
            .as_ref()
            .map(|a| a.session.state())
            .unwrap_or(TunnelState::Idle)
    }

    /// Снимок без секретов; метрики предварительно синхронизируются
    fn session_info(&mut self) -> SessionInfo {
        let state = self.tunnel_state();
        let last_error = self.last_error.clone();

        match self.active.as_mut() {
            Some(active) => {
                active.sync_metrics();
                let session = &active.session;
                SessionInfo {
                    session_id: Some(session.id()),
                    state,
                    client_public_key: Some(session.key_pair().public_base64()),
                    endpoint: Some(session.peer_config().endpoint()),
                    started_at: session.started_at(),
                    last_handshake: session.last_handshake(),
                    metrics: session
                        .started_at()
                        .map(|_| session.metrics().clone()),
                    last_error,
                }
            }
            None => SessionInfo {
                session_id: None,
                state,
                client_public_key: None,
                endpoint: None,
                started_at: None,
                last_handshake: None,
                metrics: None,
                last_error,
            },
        }
    }

    /// Активная сессия с заданным id в заданном состоянии
    fn session_in(&mut self, id: u64, state: TunnelState) -> Option<&mut ActiveSession> {
        self.active
            .as_mut()
            .filter(|a| a.session.id() == id && a.session.state() == state)
    }
}

struct Inner {
    provider: Arc<dyn TunnelProvider>,
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
    state_tx: watch::Sender<TunnelState>,
    next_id: AtomicU64,
}

/// Контроллер туннеля; клонируется дёшево (общий `Arc`)
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

impl TunnelController {
    /// Создать контроллер в состоянии Idle
    pub fn new(provider: Arc<dyn TunnelProvider>, settings: ControllerSettings) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::Idle);
        Self {
            inner: Arc::new(Inner {
                provider,
                settings,
                state: Mutex::new(ControllerState::default()),
                state_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Подписка на изменения состояния
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state_tx.subscribe()
    }

    /// Текущее состояние
    pub async fn state(&self) -> TunnelState {
        self.inner.state.lock().await.tunnel_state()
    }

    /// Подписка на метрики текущей сессии (только в Connected)
    pub async fn metrics(&self) -> Option<watch::Receiver<SessionMetrics>> {
        let guard = self.inner.state.lock().await;
        guard.active.as_ref().and_then(|a| a.metrics_rx.clone())
    }

    /// Снимок текущей сессии
    pub async fn snapshot(&self) -> SessionInfo {
        self.inner.state.lock().await.session_info()
    }

    /// Подключиться по сырой конфигурации пира
    ///
    /// Проверка состояния, валидация и генерация ключей выполняются до
    /// любых побочных эффектов; при ошибке состояние остаётся Idle.
    pub async fn connect(&self, raw_config: &str) -> Result<SessionInfo> {
        self.connect_inner(raw_config, None).await
    }

    /// Подключиться с заранее известной ключевой парой (после импорта)
    pub async fn connect_with_identity(
        &self,
        raw_config: &str,
        key_pair: KeyPair,
    ) -> Result<SessionInfo> {
        self.connect_inner(raw_config, Some(key_pair)).await
    }

    async fn connect_inner(
        &self,
        raw_config: &str,
        identity: Option<KeyPair>,
    ) -> Result<SessionInfo> {
        let inner = &self.inner;

        // Фаза 1: проверки и переход в Connecting
        let (id, key_pair, peer, cancel) = {
            let mut guard = inner.state.lock().await;
            guard.tunnel_state().on(TunnelEvent::Connect)?;

            let peer = PeerConfig::parse(raw_config)?;
            let key_pair = match identity {
                Some(pair) => pair,
                None => KeyPair::generate()?,
            };

            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            let session = TunnelSession::new(id, key_pair, peer.clone());
            let key_pair = Arc::clone(session.key_pair());
            let cancel = CancellationToken::new();

            info!(
                "Сессия {}: подключение к {} (ключ {})",
                id,
                peer.endpoint(),
                key_pair.fingerprint()
            );

            guard.last_error = None;
            guard.active = Some(ActiveSession {
                session,
                cancel: cancel.clone(),
                metrics_rx: None,
            });
            inner.publish(TunnelState::Connecting);

            (id, key_pair, peer, cancel)
        };

        // Вызов провайдера вне мьютекса
        let timeout = inner.settings.connect_timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, inner.provider.connect(&key_pair, &peer)) => Some(result),
        };
        drop(key_pair);

        // Фаза 2: применить результат, если сессия всё ещё ждёт его
        let mut guard = inner.state.lock().await;
        let Some(active) = guard.session_in(id, TunnelState::Connecting) else {
            debug!("Сессия {}: результат подключения устарел", id);
            return Err(StateError::Cancelled { session_id: id }.into());
        };

        let error = match result {
            None => return Err(StateError::Cancelled { session_id: id }.into()),
            Some(Ok(Ok(handshake))) => {
                active.session.apply(TunnelEvent::ProviderConfirmed)?;
                active.session.mark_connected(handshake.handshake_at);
                inner.start_monitor(active);
                inner.publish(TunnelState::Connected);

                info!(
                    "Сессия {}: туннель установлен ({})",
                    id, handshake.tunnel_id
                );
                return Ok(guard.session_info());
            }
            Some(Ok(Err(e))) => VpnError::Provider(e),
            Some(Err(_)) => VpnError::timeout("connect", timeout),
        };

        active.stop_tasks();
        active.session.apply(TunnelEvent::ProviderFailed)?;
        error!("Сессия {}: подключение не удалось: {}", id, error);
        guard.last_error = Some(error.to_string());
        inner.publish(TunnelState::Failed);

        Err(error)
    }

    /// Отключиться
    ///
    /// В Idle ничего не делает. В Connecting отменяет незавершённый вызов
    /// провайдера и закрывает туннель.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;

        let id = {
            let mut guard = inner.state.lock().await;
            let Some(active) = guard.active.as_mut() else {
                debug!("Отключение в Idle: ничего не делаем");
                return Ok(());
            };

            active.session.apply(TunnelEvent::Disconnect)?;
            active.stop_tasks();
            inner.publish(TunnelState::Disconnecting);

            info!("Сессия {}: отключение", active.session.id());
            active.session.id()
        };

        let timeout = inner.settings.disconnect_timeout;
        let result = tokio::time::timeout(timeout, inner.provider.disconnect()).await;

        let mut guard = inner.state.lock().await;
        let Some(active) = guard.session_in(id, TunnelState::Disconnecting) else {
            return Ok(());
        };

        let error = match result {
            Ok(Ok(())) => {
                active.session.apply(TunnelEvent::ProviderConfirmed)?;
                inner.finish_session(&mut guard, inner.settings.retain_keys_for_export);
                inner.publish(TunnelState::Idle);
                info!("Сессия {}: туннель закрыт", id);
                return Ok(());
            }
            Ok(Err(e)) => VpnError::Provider(e),
            Err(_) => VpnError::timeout("disconnect", timeout),
        };

        active.session.apply(TunnelEvent::ProviderFailed)?;
        error!("Сессия {}: закрытие туннеля не удалось: {}", id, error);
        guard.last_error = Some(error.to_string());
        inner.publish(TunnelState::Failed);

        Err(error)
    }

    /// Сбросить состояние Failed в Idle, занулив ключи
    pub async fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        let mut guard = inner.state.lock().await;

        let Some(active) = guard.active.as_mut() else {
            return Ok(());
        };

        active.session.apply(TunnelEvent::Reset)?;
        let id = active.session.id();
        inner.finish_session(&mut guard, false);
        guard.last_error = None;
        inner.publish(TunnelState::Idle);

        info!("Сессия {}: сброшена", id);
        Ok(())
    }

    /// Провайдер сообщил о разрыве туннеля без запроса клиента
    pub async fn report_drop(&self, reason: &str) -> Result<()> {
        let mut guard = self.inner.state.lock().await;
        let Some(active) = guard.active.as_mut() else {
            return Err(StateError::InvalidTransition {
                state: TunnelState::Idle,
                event: TunnelEvent::ProviderDropped.name(),
            }
            .into());
        };

        active.session.apply(TunnelEvent::ProviderDropped)?;
        active.stop_tasks();

        let id = active.session.id();
        warn!("Сессия {}: туннель разорван провайдером: {}", id, reason);
        guard.last_error = Some(format!("туннель разорван: {}", reason));
        self.inner.publish(TunnelState::Failed);
        Ok(())
    }

    /// Материал текущей или последней сохранённой сессии
    pub async fn export_material(&self) -> Option<ExportMaterial> {
        let guard = self.inner.state.lock().await;
        match &guard.active {
            Some(active) => Some((
                Arc::clone(active.session.key_pair()),
                active.session.peer_config().clone(),
            )),
            None => guard.retained.clone(),
        }
    }

    /// Занулить сохранённый для экспорта материал
    pub async fn forget_retained(&self) {
        if self.inner.state.lock().await.retained.take().is_some() {
            debug!("Сохранённая ключевая пара удалена");
        }
    }

    /// Завершить работу: закрыть туннель или сбросить сбой, удалить ключи
    pub async fn shutdown(&self) -> Result<()> {
        let result = match self.state().await {
            TunnelState::Idle => Ok(()),
            TunnelState::Failed => self.reset().await,
            _ => self.disconnect().await,
        };

        if result.is_err() && self.state().await == TunnelState::Failed {
            self.reset().await?;
        }
        self.forget_retained().await;
        result
    }
}

impl Inner {
    fn publish(&self, state: TunnelState) {
        self.state_tx.send_replace(state);
    }

    /// Убрать активную сессию; ключи зануляются, если не сохраняются
    fn finish_session(&self, state: &mut ControllerState, retain: bool) {
        if let Some(mut active) = state.active.take() {
            active.stop_tasks();
            if retain {
                state.retained = Some(active.session.into_parts());
            }
        }
    }

    fn start_monitor(self: &Arc<Self>, active: &mut ActiveSession) {
        let session = &active.session;
        let id = session.id();
        let started = session.started_instant().unwrap_or_else(tokio::time::Instant::now);
        let keepalive = self
            .settings
            .monitor
            .keepalive_for(session.peer_config().persistent_keepalive());

        let (metrics_tx, metrics_rx) = watch::channel(session.metrics().clone());
        active.metrics_rx = Some(metrics_rx);

        let monitor = StatsMonitor::new(
            Arc::clone(&self.provider),
            self.settings.monitor.clone(),
            id,
            started,
            session.last_handshake(),
            keepalive,
            metrics_tx,
            active.cancel.clone(),
        );

        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = monitor.run().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match outcome {
                MonitorOutcome::Cancelled => {}
                MonitorOutcome::Escalated(e) => {
                    inner.fail_connected(id, TunnelEvent::ProviderFailed, e).await
                }
                MonitorOutcome::Dropped(e) => {
                    inner
                        .fail_connected(id, TunnelEvent::ProviderDropped, e.into())
                        .await
                }
            }
        });
    }

    /// Перевести сессию из Connected в Failed по сигналу монитора
    async fn fail_connected(&self, id: u64, event: TunnelEvent, error: VpnError) {
        let mut guard = self.state.lock().await;
        let Some(active) = guard.session_in(id, TunnelState::Connected) else {
            return;
        };

        active.stop_tasks();
        if active.session.apply(event).is_err() {
            return;
        }

        error!("Сессия {}: {}", id, error);
        guard.last_error = Some(error.to_string());
        self.publish(TunnelState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SimulatedProvider, SimulationProfile};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn raw_peer() -> String {
        serde_json::json!({
            "endpoint": "vpn.example.com:51820",
            "peerPublicKey": BASE64.encode([9u8; 32]),
            "allowedIPs": ["0.0.0.0/0"],
            "clientAddress": "10.8.0.2",
        })
        .to_string()
    }

    fn controller(settings: ControllerSettings) -> (TunnelController, Arc<SimulatedProvider>) {
        let provider = Arc::new(SimulatedProvider::new(SimulationProfile {
            handshake_delay: Duration::from_millis(100),
            disconnect_delay: Duration::from_millis(10),
            ..SimulationProfile::default()
        }));
        (TunnelController::new(provider.clone(), settings), provider)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_disconnect() {
        let (controller, provider) = controller(ControllerSettings::default());
        let mut states = controller.subscribe();

        let info = controller.connect(&raw_peer()).await.unwrap();
        assert_eq!(info.state, TunnelState::Connected);
        assert!(info.started_at.is_some());
        assert_eq!(*states.borrow_and_update(), TunnelState::Connected);

        controller.disconnect().await.unwrap();
        assert_eq!(controller.state().await, TunnelState::Idle);
        assert!(controller.export_material().await.is_none());
        assert_eq!(provider.call_counts().1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_has_no_side_effects() {
        let (controller, provider) = controller(ControllerSettings::default());
        let result = controller.connect(r#"{"endpoint":"http://x:1"}"#).await;

        assert!(matches!(result, Err(VpnError::Validation(_))));
        assert_eq!(controller.state().await, TunnelState::Idle);
        assert_eq!(provider.call_counts(), (0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_keys_for_export() {
        let (controller, _) = controller(ControllerSettings {
            retain_keys_for_export: true,
            ..ControllerSettings::default()
        });

        let info = controller.connect(&raw_peer()).await.unwrap();
        controller.disconnect().await.unwrap();

        let (key_pair, peer) = controller.export_material().await.unwrap();
        assert_eq!(Some(key_pair.public_base64()), info.client_public_key);
        assert_eq!(peer.endpoint(), "vpn.example.com:51820");

        controller.forget_retained().await;
        assert!(controller.export_material().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rules() {
        let (controller, provider) = controller(ControllerSettings::default());

        controller.reset().await.unwrap();
        assert_eq!(controller.state().await, TunnelState::Idle);

        provider.fail_next_connect("rejected");
        assert!(controller.connect(&raw_peer()).await.is_err());
        assert_eq!(controller.state().await, TunnelState::Failed);
        assert!(controller.snapshot().await.last_error.is_some());

        assert!(matches!(
            controller.disconnect().await,
            Err(VpnError::State(StateError::ResetRequired))
        ));

        controller.reset().await.unwrap();
        assert_eq!(controller.state().await, TunnelState::Idle);
        assert!(controller.export_material().await.is_none());

        controller.connect(&raw_peer()).await.unwrap();
        assert!(matches!(
            controller.reset().await,
            Err(VpnError::State(StateError::InvalidTransition { .. }))
        ));
        assert_eq!(controller.state().await, TunnelState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wipes_everything() {
        let (controller, _) = controller(ControllerSettings {
            retain_keys_for_export: true,
            ..ControllerSettings::default()
        });

        controller.connect(&raw_peer()).await.unwrap();
        controller.shutdown().await.unwrap();

        assert_eq!(controller.state().await, TunnelState::Idle);
        assert!(controller.export_material().await.is_none());
    }
}
