//! Типы ошибок ядра Prime VPN
//!
//! Этот модуль содержит всю таксономию ошибок менеджера туннельных сессий
//! и защищённого хранилища. Ни одно сообщение об ошибке не содержит
//! ключевого материала, токенов или парольных фраз.

use thiserror::Error;

use crate::session::TunnelState;

/// Основной тип ошибок ядра
#[derive(Error, Debug)]
pub enum VpnError {
    /// Некорректная или небезопасная конфигурация пира
    #[error("Некорректная конфигурация пира: {0}")]
    Validation(#[from] ValidationError),

    /// Ошибка генерации, деривации или шифрования
    #[error("Криптографическая ошибка: {0}")]
    Crypto(#[from] CryptoError),

    /// Auth tag не прошёл проверку (данные изменены или ключ неверный)
    #[error("Нарушена целостность данных: auth tag не совпадает")]
    Integrity,

    /// Ошибка платформенного провайдера туннеля
    #[error("Ошибка провайдера туннеля: {0}")]
    Provider(#[from] ProviderError),

    /// Превышено время ожидания операции
    #[error("Тайм-аут операции {operation}: превышено {timeout_ms} мс")]
    Timeout {
        /// Название операции
        operation: &'static str,
        /// Допустимое время ожидания
        timeout_ms: u64,
    },

    /// Недопустимый переход жизненного цикла туннеля
    #[error("Ошибка состояния: {0}")]
    State(#[from] StateError),

    /// Нет текущей или последней сессии
    #[error("Нет сессии для экспорта")]
    NoSession,

    /// Запись в хранилище не найдена
    #[error("Запись '{name}' не найдена")]
    NotFound {
        /// Имя записи
        name: String,
    },

    /// Ошибка внешнего защищённого хранилища
    #[error("Ошибка хранилища: {0}")]
    Storage(String),

    /// Ошибка ввода-вывода
    #[error("Ошибка I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl VpnError {
    /// Тайм-аут для операции с заданным пределом
    pub fn timeout(operation: &'static str, limit: std::time::Duration) -> Self {
        VpnError::Timeout {
            operation,
            timeout_ms: limit.as_millis() as u64,
        }
    }

    /// Ошибку можно повторить автоматически (только сбои провайдера и тайм-ауты)
    pub fn is_transient(&self) -> bool {
        matches!(self, VpnError::Provider(_) | VpnError::Timeout { .. })
    }
}

/// Ошибки валидации конфигурации пира
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Отсутствует обязательное поле
    #[error("Отсутствует обязательное поле '{0}'")]
    MissingField(&'static str),

    /// Публичный ключ пира не является корректным ключом X25519
    #[error("Некорректный формат публичного ключа: {0}")]
    InvalidKeyFormat(String),

    /// Некорректный endpoint
    #[error("Некорректный endpoint '{value}': {reason}")]
    InvalidEndpoint {
        /// Исходное значение
        value: String,
        /// Причина отказа
        reason: &'static str,
    },

    /// Некорректный список AllowedIPs
    #[error("Некорректный AllowedIPs: {0}")]
    InvalidAllowedIps(String),

    /// Некорректный IP адрес или числовой параметр
    #[error("Некорректное значение поля '{field}': {value}")]
    InvalidAddress {
        /// Имя поля
        field: &'static str,
        /// Исходное значение
        value: String,
    },

    /// Документ не является JSON объектом нужной формы
    #[error("Повреждённый документ конфигурации: {0}")]
    Malformed(String),
}

/// Ошибки криптографических операций
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Источник энтропии недоступен
    #[error("Источник энтропии недоступен: {0}")]
    EntropyUnavailable(String),

    /// Ошибка деривации ключа
    #[error("Ошибка деривации ключа: {0}")]
    KeyDerivation(String),

    /// Параметры KDF слабее допустимого минимума
    #[error("Параметры KDF слишком слабые: {0}")]
    WeakKdfParams(String),

    /// Токен аутентификации не годится для деривации
    #[error("Токен аутентификации отклонён: ожидается минимум {min_len} символов")]
    InvalidAuthToken {
        /// Минимальная длина
        min_len: usize,
    },

    /// Ошибка шифрования
    #[error("Ошибка шифрования данных")]
    Encryption,

    /// Данные больше допустимого размера контейнера
    #[error("Слишком большие данные: {size} байт при максимуме {max}")]
    PayloadTooLarge {
        /// Фактический размер
        size: usize,
        /// Допустимый максимум
        max: usize,
    },

    /// Ошибка расшифровки (повреждённый контейнер)
    #[error("Ошибка расшифровки данных: {0}")]
    Decryption(String),

    /// Некорректный размер ключа
    #[error("Некорректный размер ключа: ожидается {expected}, получено {actual}")]
    InvalidKeySize {
        /// Ожидаемый размер
        expected: usize,
        /// Фактический размер
        actual: usize,
    },

    /// Неизвестный идентификатор алгоритма
    #[error("Неподдерживаемый алгоритм: {0}")]
    UnsupportedAlgorithm(String),

    /// Хранилище заблокировано (нет сессионного ключа)
    #[error("Хранилище заблокировано: сессионный ключ отсутствует")]
    VaultLocked,
}

/// Ошибки платформенного провайдера туннеля
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Провайдер отклонил подключение или handshake не удался
    #[error("Подключение отклонено: {0}")]
    ConnectFailed(String),

    /// Провайдер не смог закрыть туннель
    #[error("Ошибка закрытия туннеля: {0}")]
    DisconnectFailed(String),

    /// Не удалось получить статус туннеля
    #[error("Статус туннеля недоступен: {0}")]
    StatusUnavailable(String),

    /// Туннель разорван без запроса клиента
    #[error("Туннель разорван провайдером: {0}")]
    TunnelDropped(String),
}

/// Ошибки жизненного цикла туннеля
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Сессия уже активна
    #[error("Сессия уже активна (состояние {state})")]
    AlreadyActive {
        /// Текущее состояние
        state: TunnelState,
    },

    /// После сбоя требуется reset()
    #[error("Туннель в состоянии Failed: требуется reset()")]
    ResetRequired,

    /// Переход уже выполняется
    #[error("Переход уже выполняется (состояние {state})")]
    InProgress {
        /// Текущее состояние
        state: TunnelState,
    },

    /// Событие недопустимо в текущем состоянии
    #[error("Недопустимый переход: {event} в состоянии {state}")]
    InvalidTransition {
        /// Текущее состояние
        state: TunnelState,
        /// Название события
        event: &'static str,
    },

    /// Операция отменена, сессия сменилась
    #[error("Операция отменена: сессия {session_id} больше не активна")]
    Cancelled {
        /// Идентификатор сессии
        session_id: u64,
    },
}

/// Псевдоним для Result с ошибкой ядра
pub type Result<T> = std::result::Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_classification() {
        assert!(VpnError::timeout("status", Duration::from_secs(3)).is_transient());
        assert!(VpnError::from(ProviderError::StatusUnavailable("io".into())).is_transient());
        assert!(!VpnError::Integrity.is_transient());
        assert!(!VpnError::from(StateError::ResetRequired).is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = VpnError::timeout("connect", Duration::from_millis(1500));
        assert!(err.to_string().contains("1500"));
        assert!(err.to_string().contains("connect"));
    }
}
