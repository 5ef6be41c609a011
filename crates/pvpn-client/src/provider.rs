//! Платформенный провайдер туннеля
//!
//! Провайдер (системное VPN расширение) выполняет handshake и шифрование
//! трафика. Клиент только вызывает его и интерпретирует результаты.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pvpn_core::{KeyPair, PeerConfig, ProviderError};
use tokio::time::Instant;
use tracing::{debug, info};

/// Результат установления туннеля
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Идентификатор туннеля у провайдера
    pub tunnel_id: String,
    /// Время первого handshake
    pub handshake_at: Option<DateTime<Utc>>,
}

/// Состояние туннеля по данным провайдера
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderTunnelState {
    /// Туннель поднят
    Up,
    /// Туннель опущен или разорван
    Down,
    /// Провайдер переустанавливает туннель
    Connecting,
}

/// Снимок статуса туннеля
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    /// Состояние
    pub state: ProviderTunnelState,
    /// Принято байт (счётчик провайдера, может сбрасываться)
    pub bytes_in: u64,
    /// Отправлено байт
    pub bytes_out: u64,
    /// Время последнего handshake
    pub last_handshake: Option<DateTime<Utc>>,
}

/// Возможности платформенного провайдера туннеля
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Поднять туннель с ключевой парой клиента и конфигурацией пира
    async fn connect(
        &self,
        key_pair: &KeyPair,
        peer: &PeerConfig,
    ) -> Result<HandshakeResult, ProviderError>;

    /// Опустить туннель
    async fn disconnect(&self) -> Result<(), ProviderError>;

    /// Текущий статус туннеля
    async fn status(&self) -> Result<ProviderStatus, ProviderError>;
}

/// Параметры симулированного провайдера
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    /// Задержка handshake
    pub handshake_delay: Duration,
    /// Задержка закрытия туннеля
    pub disconnect_delay: Duration,
    /// Скорость приёма (байт/с)
    pub rx_bytes_per_sec: u64,
    /// Скорость отправки (байт/с)
    pub tx_bytes_per_sec: u64,
    /// Период обновления handshake
    pub handshake_refresh: Duration,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(200),
            disconnect_delay: Duration::from_millis(50),
            rx_bytes_per_sec: 128 * 1024,
            tx_bytes_per_sec: 32 * 1024,
            handshake_refresh: Duration::from_secs(120),
        }
    }
}

#[derive(Default)]
struct SimulationState {
    up_since: Option<Instant>,
    connected_wall: Option<DateTime<Utc>>,
    last_handshake: Option<DateTime<Utc>>,
    connect_failure: Option<String>,
    status_failures: u32,
    dropped: bool,
    handshake_stalled: bool,
    connects: u32,
    disconnects: u32,
    status_calls: u32,
}

/// Детерминированный провайдер в памяти процесса
///
/// Используется командой `simulate` и тестами. Счётчики байт растут
/// линейно со временем; сбои внедряются через `fail_*` методы.
pub struct SimulatedProvider {
    profile: SimulationProfile,
    state: Mutex<SimulationState>,
}

impl SimulatedProvider {
    /// Создать провайдер с заданным профилем
    pub fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            state: Mutex::new(SimulationState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimulationState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Следующий connect завершится ошибкой
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_state(|s| s.connect_failure = Some(reason));
    }

    /// Следующие `count` запросов статуса завершатся ошибкой
    pub fn fail_status(&self, count: u32) {
        self.with_state(|s| s.status_failures = count);
    }

    /// Разорвать туннель без запроса клиента
    pub fn drop_tunnel(&self) {
        self.with_state(|s| s.dropped = true);
    }

    /// Перестать обновлять handshake
    pub fn stall_handshake(&self) {
        self.with_state(|s| s.handshake_stalled = true);
    }

    /// Число вызовов (connect, disconnect, status)
    pub fn call_counts(&self) -> (u32, u32, u32) {
        self.with_state(|s| (s.connects, s.disconnects, s.status_calls))
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

#[async_trait]
impl TunnelProvider for SimulatedProvider {
    async fn connect(
        &self,
        key_pair: &KeyPair,
        peer: &PeerConfig,
    ) -> Result<HandshakeResult, ProviderError> {
        let failure = self.with_state(|s| {
            s.connects += 1;
            s.connect_failure.take()
        });

        // Движку передаётся документ wg-quick; в логи попадает только размер
        let document = peer.to_wg_quick(key_pair);
        debug!(
            "Симуляция: конфигурация движка {} байт для {}",
            document.len(),
            peer.endpoint()
        );

        tokio::time::sleep(self.profile.handshake_delay).await;

        if let Some(reason) = failure {
            return Err(ProviderError::ConnectFailed(reason));
        }

        let now = Utc::now();
        self.with_state(|s| {
            s.up_since = Some(Instant::now());
            s.connected_wall = Some(now);
            s.last_handshake = Some(now);
            s.dropped = false;
            s.handshake_stalled = false;
        });

        info!("Симуляция: туннель поднят ({})", peer.endpoint());

        Ok(HandshakeResult {
            tunnel_id: format!("sim-{}", key_pair.fingerprint()),
            handshake_at: Some(now),
        })
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        tokio::time::sleep(self.profile.disconnect_delay).await;

        self.with_state(|s| {
            s.disconnects += 1;
            s.up_since = None;
            s.connected_wall = None;
            s.last_handshake = None;
        });

        info!("Симуляция: туннель опущен");
        Ok(())
    }

    async fn status(&self) -> Result<ProviderStatus, ProviderError> {
        let profile = &self.profile;

        self.with_state(|s| {
            s.status_calls += 1;

            if s.status_failures > 0 {
                s.status_failures -= 1;
                return Err(ProviderError::StatusUnavailable(
                    "симулированный сбой".into(),
                ));
            }

            let (Some(up_since), Some(connected_wall)) = (s.up_since, s.connected_wall) else {
                return Ok(down());
            };
            if s.dropped {
                return Ok(down());
            }

            let elapsed = up_since.elapsed();

            if !s.handshake_stalled && !profile.handshake_refresh.is_zero() {
                let refreshes = elapsed.as_millis() / profile.handshake_refresh.as_millis();
                let offset = profile.handshake_refresh.as_millis() * refreshes;
                s.last_handshake = Some(
                    connected_wall + chrono::Duration::milliseconds(offset as i64),
                );
            }

            Ok(ProviderStatus {
                state: ProviderTunnelState::Up,
                bytes_in: rate(profile.rx_bytes_per_sec, elapsed),
                bytes_out: rate(profile.tx_bytes_per_sec, elapsed),
                last_handshake: s.last_handshake,
            })
        })
    }
}

fn down() -> ProviderStatus {
    ProviderStatus {
        state: ProviderTunnelState::Down,
        bytes_in: 0,
        bytes_out: 0,
        last_handshake: None,
    }
}

fn rate(bytes_per_sec: u64, elapsed: Duration) -> u64 {
    (bytes_per_sec as u128 * elapsed.as_millis() / 1000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerConfig {
        PeerConfig::parse(
            r#"{"endpoint":"198.51.100.1:51820","peerPublicKey":"BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=","allowedIPs":["0.0.0.0/0"],"clientAddress":"10.8.0.2"}"#,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_lifecycle() {
        let provider = SimulatedProvider::default();
        let pair = KeyPair::generate().unwrap();

        let down = provider.status().await.unwrap();
        assert_eq!(down.state, ProviderTunnelState::Down);

        let handshake = provider.connect(&pair, &peer()).await.unwrap();
        assert!(handshake.tunnel_id.starts_with("sim-"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = provider.status().await.unwrap();
        assert_eq!(status.state, ProviderTunnelState::Up);
        assert_eq!(status.bytes_in, 2 * 128 * 1024);
        assert_eq!(status.bytes_out, 2 * 32 * 1024);

        provider.disconnect().await.unwrap();
        assert_eq!(provider.status().await.unwrap().state, ProviderTunnelState::Down);
        assert_eq!(provider.call_counts(), (1, 1, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failures() {
        let provider = SimulatedProvider::default();
        let pair = KeyPair::generate().unwrap();

        provider.fail_next_connect("handshake rejected");
        assert!(matches!(
            provider.connect(&pair, &peer()).await,
            Err(ProviderError::ConnectFailed(_))
        ));
        provider.connect(&pair, &peer()).await.unwrap();

        provider.fail_status(1);
        assert!(provider.status().await.is_err());
        assert!(provider.status().await.is_ok());

        provider.drop_tunnel();
        assert_eq!(provider.status().await.unwrap().state, ProviderTunnelState::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_refresh() {
        let provider = SimulatedProvider::new(SimulationProfile {
            handshake_refresh: Duration::from_secs(10),
            ..SimulationProfile::default()
        });
        provider.connect(&KeyPair::generate().unwrap(), &peer()).await.unwrap();

        let first = provider.status().await.unwrap().last_handshake;
        tokio::time::sleep(Duration::from_secs(11)).await;
        let refreshed = provider.status().await.unwrap().last_handshake;
        assert!(refreshed > first);

        provider.stall_handshake();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(provider.status().await.unwrap().last_handshake, refreshed);
    }
}
