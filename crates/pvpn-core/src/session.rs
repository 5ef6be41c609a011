//! Жизненный цикл туннельной сессии
//!
//! Этот модуль содержит:
//! - Таблицу переходов состояний туннеля ([`TunnelState::on`])
//! - Активную сессию [`TunnelSession`] с ключевой парой и метриками
//!
//! Таблица переходов чистая: она ничего не делает, только решает, допустимо
//! ли событие. Побочные эффекты (провайдер, монитор) выполняет контроллер.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::StateError;
use crate::keys::KeyPair;
use crate::peer::PeerConfig;

/// Состояние туннеля
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TunnelState {
    /// Нет сессии
    Idle,
    /// Провайдер устанавливает туннель
    Connecting,
    /// Туннель установлен, монитор работает
    Connected,
    /// Провайдер закрывает туннель
    Disconnecting,
    /// Сбой; требуется reset()
    Failed,
}

impl TunnelState {
    /// Есть ли в этом состоянии сессия
    pub fn has_session(&self) -> bool {
        !matches!(self, TunnelState::Idle)
    }

    /// Следующее состояние для события
    ///
    /// Возвращает [`StateError`], если событие недопустимо; состояние при
    /// этом не меняется.
    pub fn on(self, event: TunnelEvent) -> Result<TunnelState, StateError> {
        use TunnelEvent::*;
        use TunnelState::*;

        match (self, event) {
            (Idle, Connect) => Ok(Connecting),
            (Connecting | Connected, Connect) => Err(StateError::AlreadyActive { state: self }),
            (Disconnecting, Connect) => Err(StateError::InProgress { state: self }),
            (Failed, Connect) => Err(StateError::ResetRequired),

            (Connecting, ProviderConfirmed) => Ok(Connected),
            (Disconnecting, ProviderConfirmed) => Ok(Idle),

            (Connecting | Connected | Disconnecting, ProviderFailed) => Ok(Failed),
            (Connected, ProviderDropped) => Ok(Failed),

            (Idle, Disconnect) => Ok(Idle),
            (Connecting | Connected, Disconnect) => Ok(Disconnecting),
            (Disconnecting, Disconnect) => Err(StateError::InProgress { state: self }),
            (Failed, Disconnect) => Err(StateError::ResetRequired),

            (Failed | Idle, Reset) => Ok(Idle),

            (state, event) => Err(StateError::InvalidTransition {
                state,
                event: event.name(),
            }),
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Idle => "Idle",
            TunnelState::Connecting => "Connecting",
            TunnelState::Connected => "Connected",
            TunnelState::Disconnecting => "Disconnecting",
            TunnelState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Событие жизненного цикла
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Запрос подключения
    Connect,
    /// Провайдер подтвердил операцию (connect или disconnect)
    ProviderConfirmed,
    /// Ошибка или тайм-аут провайдера
    ProviderFailed,
    /// Запрос отключения
    Disconnect,
    /// Провайдер сам разорвал туннель
    ProviderDropped,
    /// Сброс после сбоя
    Reset,
}

impl TunnelEvent {
    /// Название события для сообщений об ошибках
    pub fn name(&self) -> &'static str {
        match self {
            TunnelEvent::Connect => "connect",
            TunnelEvent::ProviderConfirmed => "provider_confirmed",
            TunnelEvent::ProviderFailed => "provider_failed",
            TunnelEvent::Disconnect => "disconnect",
            TunnelEvent::ProviderDropped => "provider_dropped",
            TunnelEvent::Reset => "reset",
        }
    }
}

/// Нефатальное предупреждение о здоровье туннеля
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthWarning {
    /// Handshake не обновлялся дольше 3 × keepalive
    StaleHandshake {
        /// Сколько прошло с последнего обновления
        since: Duration,
    },
}

/// Метрики активной сессии
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    /// Длительность с момента подключения
    pub duration: Duration,
    /// Принято байт (суммарно, с учётом сбросов счётчиков провайдера)
    pub bytes_in: u64,
    /// Отправлено байт
    pub bytes_out: u64,
    /// Время последнего handshake по данным провайдера
    pub last_handshake: Option<DateTime<Utc>>,
    /// Текущее предупреждение
    pub warning: Option<HealthWarning>,
    /// Число успешных опросов
    pub polls: u64,
}

/// Активная туннельная сессия
///
/// Ключевая пара принадлежит сессии; `Arc` разделяется только на время
/// вызова провайдера. Удаление сессии зануляет приватный ключ.
pub struct TunnelSession {
    id: u64,
    key_pair: Arc<KeyPair>,
    peer_config: PeerConfig,
    state: TunnelState,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    last_handshake: Option<DateTime<Utc>>,
    metrics: SessionMetrics,
}

impl TunnelSession {
    /// Создать сессию в состоянии Connecting
    pub fn new(id: u64, key_pair: KeyPair, peer_config: PeerConfig) -> Self {
        Self {
            id,
            key_pair: Arc::new(key_pair),
            peer_config,
            state: TunnelState::Connecting,
            started_at: None,
            started_instant: None,
            last_handshake: None,
            metrics: SessionMetrics::default(),
        }
    }

    /// Идентификатор сессии
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Текущее состояние
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Применить событие к сессии
    pub fn apply(&mut self, event: TunnelEvent) -> Result<TunnelState, StateError> {
        self.state = self.state.on(event)?;
        Ok(self.state)
    }

    /// Ключевая пара клиента
    pub fn key_pair(&self) -> &Arc<KeyPair> {
        &self.key_pair
    }

    /// Конфигурация пира
    pub fn peer_config(&self) -> &PeerConfig {
        &self.peer_config
    }

    /// Зафиксировать подключение: время старта и первый handshake
    pub fn mark_connected(&mut self, handshake_at: Option<DateTime<Utc>>) {
        self.started_at = Some(Utc::now());
        self.started_instant = Some(Instant::now());
        self.last_handshake = handshake_at;
        self.metrics.last_handshake = handshake_at;
    }

    /// Время подключения (wall clock)
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Время подключения (монотонное)
    pub fn started_instant(&self) -> Option<Instant> {
        self.started_instant
    }

    /// Время последнего handshake
    pub fn last_handshake(&self) -> Option<DateTime<Utc>> {
        self.last_handshake
    }

    /// Последние метрики
    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Обновить метрики (только из монитора)
    pub fn update_metrics(&mut self, metrics: SessionMetrics) {
        if metrics.last_handshake.is_some() {
            self.last_handshake = metrics.last_handshake;
        }
        self.metrics = metrics;
    }

    /// Разобрать сессию, оставив материал для экспорта
    pub fn into_parts(self) -> (Arc<KeyPair>, PeerConfig) {
        (self.key_pair, self.peer_config)
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("key_pair", &self.key_pair)
            .field("endpoint", &self.peer_config.endpoint())
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TunnelEvent::*;
    use TunnelState::*;

    const ALL_STATES: [TunnelState; 5] = [Idle, Connecting, Connected, Disconnecting, Failed];

    fn peer() -> PeerConfig {
        PeerConfig::parse(
            r#"{"endpoint":"10.0.0.1:51820","peerPublicKey":"BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=","allowedIPs":["0.0.0.0/0"],"clientAddress":"10.8.0.2"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_happy_path() {
        let mut state = Idle;
        for (event, expected) in [
            (Connect, Connecting),
            (ProviderConfirmed, Connected),
            (Disconnect, Disconnecting),
            (ProviderConfirmed, Idle),
        ] {
            state = state.on(event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_failure_paths() {
        assert_eq!(Connecting.on(ProviderFailed).unwrap(), Failed);
        assert_eq!(Connected.on(ProviderDropped).unwrap(), Failed);
        assert_eq!(Connected.on(ProviderFailed).unwrap(), Failed);
        assert_eq!(Disconnecting.on(ProviderFailed).unwrap(), Failed);
        assert_eq!(Failed.on(Reset).unwrap(), Idle);
    }

    #[test]
    fn test_double_connect() {
        assert_eq!(
            Connecting.on(Connect).unwrap_err(),
            StateError::AlreadyActive { state: Connecting }
        );
        assert_eq!(
            Connected.on(Connect).unwrap_err(),
            StateError::AlreadyActive { state: Connected }
        );
        assert_eq!(Failed.on(Connect).unwrap_err(), StateError::ResetRequired);
    }

    #[test]
    fn test_idempotent_disconnect_and_reset() {
        assert_eq!(Idle.on(Disconnect).unwrap(), Idle);
        assert_eq!(Idle.on(Reset).unwrap(), Idle);
        assert_eq!(Connecting.on(Disconnect).unwrap(), Disconnecting);
    }

    #[test]
    fn test_invalid_transitions() {
        for state in [Connecting, Connected, Disconnecting] {
            assert!(matches!(
                state.on(Reset),
                Err(StateError::InvalidTransition { event: "reset", .. })
            ));
        }
        for state in [Idle, Connecting, Disconnecting, Failed] {
            assert!(state.on(ProviderDropped).is_err());
        }
        assert!(Idle.on(ProviderConfirmed).is_err());
        assert!(Failed.on(ProviderConfirmed).is_err());
    }

    #[test]
    fn test_only_idle_has_no_session() {
        for state in ALL_STATES {
            assert_eq!(state.has_session(), state != Idle);
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let pair = KeyPair::generate().unwrap();
        let public = pair.public_bytes();
        let mut session = TunnelSession::new(1, pair, peer());

        assert_eq!(session.state(), Connecting);
        assert!(session.started_at().is_none());

        assert!(session.apply(Connect).is_err());
        assert_eq!(session.state(), Connecting);

        session.apply(ProviderConfirmed).unwrap();
        session.mark_connected(Some(Utc::now()));
        assert!(session.started_at().is_some());
        assert!(session.last_handshake().is_some());

        session.update_metrics(SessionMetrics {
            bytes_in: 10,
            polls: 1,
            ..SessionMetrics::default()
        });
        assert_eq!(session.metrics().bytes_in, 10);
        assert!(session.last_handshake().is_some());

        let (key_pair, config) = session.into_parts();
        assert_eq!(key_pair.public_bytes(), public);
        assert_eq!(config, peer());
    }

    #[test]
    fn test_debug_hides_private_key() {
        let pair = KeyPair::generate().unwrap();
        let private = pair.private_base64();
        let session = TunnelSession::new(7, pair, peer());
        assert!(!format!("{:?}", session).contains(private.as_str()));
    }
}
