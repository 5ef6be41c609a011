//! Мониторинг активного туннеля
//!
//! StatsMonitor опрашивает провайдера с фиксированным интервалом, пока
//! сессия в состоянии Connected:
//! - длительность сессии считается по монотонным часам
//! - счётчики байт суммируются с учётом сбросов счётчиков провайдера
//! - устаревший handshake (дольше 3 × keepalive) даёт нефатальное предупреждение
//! - сбой опроса повторяется с экспоненциальной задержкой ограниченное число раз
//!
//! Время жизни задачи привязано к [`CancellationToken`] сессии. Отмена
//! проверяется перед каждой публикацией метрик.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pvpn_core::session::{HealthWarning, SessionMetrics};
use pvpn_core::{ProviderError, VpnError};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::provider::{ProviderStatus, ProviderTunnelState, TunnelProvider};

/// Сколько интервалов keepalive без handshake считаются нормой
const STALE_HANDSHAKE_FACTOR: u32 = 3;

/// Максимальный показатель степени для backoff
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Настройки мониторинга
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Интервал опроса
    pub poll_interval: Duration,
    /// Тайм-аут одного запроса статуса
    pub poll_timeout: Duration,
    /// Число повторов после неудачного опроса
    pub max_retries: u32,
    /// Базовая задержка backoff (удваивается на каждом повторе)
    pub backoff_base: Duration,
    /// Keepalive, если пир его не задал
    pub default_keepalive: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(3),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            default_keepalive: Duration::from_secs(25),
        }
    }
}

impl MonitorSettings {
    /// Keepalive сессии: значение пира или значение по умолчанию
    pub fn keepalive_for(&self, peer_keepalive: Option<u16>) -> Duration {
        peer_keepalive
            .map(|secs| Duration::from_secs(secs.into()))
            .unwrap_or(self.default_keepalive)
    }

    /// Задержка перед повтором номер `attempt` (с нуля)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1u32 << attempt.min(MAX_BACKOFF_SHIFT))
    }
}

/// Чем закончилась работа монитора
#[derive(Debug)]
pub enum MonitorOutcome {
    /// Сессия покинула Connected
    Cancelled,
    /// Исчерпаны повторы опроса
    Escalated(VpnError),
    /// Провайдер сообщил, что туннель опущен
    Dropped(ProviderError),
}

/// Суммарные счётчики с учётом сбросов
#[derive(Debug, Default)]
struct ByteCounters {
    total_in: u64,
    total_out: u64,
    last_raw: Option<(u64, u64)>,
}

impl ByteCounters {
    fn record(&mut self, raw_in: u64, raw_out: u64) {
        let (delta_in, delta_out) = match self.last_raw {
            Some((prev_in, prev_out)) => (delta(prev_in, raw_in), delta(prev_out, raw_out)),
            None => (raw_in, raw_out),
        };
        self.total_in = self.total_in.saturating_add(delta_in);
        self.total_out = self.total_out.saturating_add(delta_out);
        self.last_raw = Some((raw_in, raw_out));
    }
}

fn delta(prev: u64, current: u64) -> u64 {
    // Счётчик меньше предыдущего: провайдер его сбросил
    if current >= prev {
        current - prev
    } else {
        current
    }
}

/// Монитор статистики одной сессии
pub struct StatsMonitor {
    provider: Arc<dyn TunnelProvider>,
    settings: MonitorSettings,
    session_id: u64,
    started: Instant,
    stale_after: Duration,
    metrics_tx: watch::Sender<SessionMetrics>,
    cancel: CancellationToken,
    counters: ByteCounters,
    handshake_seen: Option<DateTime<Utc>>,
    handshake_refreshed: Instant,
    polls: u64,
}

impl StatsMonitor {
    /// Создать монитор для сессии
    ///
    /// # Параметры
    /// - `started`: Момент перехода в Connected
    /// - `keepalive`: Интервал keepalive сессии
    /// - `metrics_tx`: Канал публикации метрик
    /// - `cancel`: Токен, отменяемый при выходе из Connected
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn TunnelProvider>,
        settings: MonitorSettings,
        session_id: u64,
        started: Instant,
        initial_handshake: Option<DateTime<Utc>>,
        keepalive: Duration,
        metrics_tx: watch::Sender<SessionMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            settings,
            session_id,
            started,
            stale_after: keepalive.saturating_mul(STALE_HANDSHAKE_FACTOR),
            metrics_tx,
            cancel,
            counters: ByteCounters::default(),
            handshake_seen: initial_handshake,
            handshake_refreshed: started,
            polls: 0,
        }
    }

    /// Основной цикл опроса
    pub async fn run(mut self) -> MonitorOutcome {
        let period = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "Монитор сессии {} запущен (интервал {:?})",
            self.session_id, period
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.stopped(),
                _ = ticker.tick() => {}
            }

            let status = match self.poll_with_retry().await {
                Ok(Some(status)) => status,
                Ok(None) => return self.stopped(),
                Err(e) => {
                    error!(
                        "Сессия {}: опрос провайдера не удался после {} повторов: {}",
                        self.session_id, self.settings.max_retries, e
                    );
                    return MonitorOutcome::Escalated(e);
                }
            };

            if self.cancel.is_cancelled() {
                return self.stopped();
            }

            if status.state == ProviderTunnelState::Down {
                warn!("Сессия {}: провайдер сообщил о разрыве туннеля", self.session_id);
                return MonitorOutcome::Dropped(ProviderError::TunnelDropped(
                    "статус провайдера: Down".into(),
                ));
            }

            let metrics = self.record(&status);
            self.metrics_tx.send_replace(metrics);
        }
    }

    fn stopped(&self) -> MonitorOutcome {
        debug!("Монитор сессии {} остановлен", self.session_id);
        MonitorOutcome::Cancelled
    }

    /// Один опрос с повторами; `Ok(None)` означает отмену
    async fn poll_with_retry(&self) -> Result<Option<ProviderStatus>, VpnError> {
        let mut attempt = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                result = tokio::time::timeout(self.settings.poll_timeout, self.provider.status()) => result,
            };

            let err = match result {
                Ok(Ok(status)) => return Ok(Some(status)),
                Ok(Err(e)) => VpnError::Provider(e),
                Err(_) => VpnError::timeout("status", self.settings.poll_timeout),
            };

            if attempt >= self.settings.max_retries {
                return Err(err);
            }

            let backoff = self.settings.backoff(attempt);
            warn!(
                "Сессия {}: опрос не удался ({}), повтор {}/{} через {:?}",
                self.session_id,
                err,
                attempt + 1,
                self.settings.max_retries,
                backoff
            );
            attempt += 1;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    fn record(&mut self, status: &ProviderStatus) -> SessionMetrics {
        let now = Instant::now();
        self.polls += 1;
        self.counters.record(status.bytes_in, status.bytes_out);

        if status.last_handshake.is_some() && status.last_handshake != self.handshake_seen {
            self.handshake_seen = status.last_handshake;
            self.handshake_refreshed = now;
        }

        let since = now.saturating_duration_since(self.handshake_refreshed);
        let warning = (since > self.stale_after).then_some(HealthWarning::StaleHandshake { since });

        let previous_warning = self.metrics_tx.borrow().warning.is_some();
        if warning.is_some() && !previous_warning {
            warn!(
                "Сессия {}: handshake не обновлялся {:?} (порог {:?})",
                self.session_id, since, self.stale_after
            );
        }

        SessionMetrics {
            duration: now.saturating_duration_since(self.started),
            bytes_in: self.counters.total_in,
            bytes_out: self.counters.total_out,
            last_handshake: self.handshake_seen,
            warning,
            polls: self.polls,
        }
    }
}
