use std::fmt;

use num_enum::TryFromPrimitive;

/// Коды статуса для категоризации ошибок клиента.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки входных данных (имена, адреса, параметры)
/// - 3xxx: Ошибки состояния клиента (остановлен, нет соединения)
/// - 6xxx: Сеть / IO
/// - 7xxx: Обнаружение узлов (nsqlookupd)
/// - 8xxx: Протокол NSQ
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unexpected = 1001,
    Internal = 1002,
    InvalidArgs = 1003,
    Config = 1004,

    // === 2xxx: Входные данные ===
    InvalidName = 2000,
    InvalidAddress = 2001,
    InvalidMessageParam = 2002,
    EmptyMessages = 2003,

    // === 3xxx: Состояние клиента ===
    Stopped = 3000,
    NotConnected = 3001,
    PublishInFlight = 3002,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ConnectTimeout = 6003,
    ConnectionFailed = 6004,
    PublishTimeout = 6005,
    UnexpectedEof = 6006,

    // === 7xxx: Обнаружение ===
    LookupFailed = 7000,

    // === 8xxx: Протокол ===
    ProtocolError = 8000,
    InvalidFrame = 8001,
    FrameTooLarge = 8002,
    ServerError = 8003,
    InvalidUtf8 = 8004,
    EncodingError = 8005,
    DecodingError = 8006,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию с такой ошибкой имеет смысл повторить
    /// (например, публикацию после переподключения).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectTimeout
                | Self::PublishTimeout
                | Self::ConnectionFailed
                | Self::ConnectionClosed
                | Self::Io
                | Self::ServerError
                | Self::LookupFailed
                | Self::NotConnected
        )
    }

    /// Ошибка вызывающей стороны: повтор ничего не изменит.
    pub fn is_client_error(&self) -> bool {
        let c = self.code();
        (2000..=3999).contains(&c) || matches!(self, Self::InvalidArgs | Self::Config)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что сетевые ошибки и ошибки nsqd считаются
    /// повторяемыми, а ошибки валидации нет.
    #[test]
    fn test_retryable() {
        assert!(StatusCode::PublishTimeout.is_retryable());
        assert!(StatusCode::ServerError.is_retryable());
        assert!(!StatusCode::InvalidName.is_retryable());
        assert!(!StatusCode::PublishInFlight.is_retryable());
    }

    #[test]
    fn test_client_errors() {
        assert!(StatusCode::InvalidName.is_client_error());
        assert!(StatusCode::Stopped.is_client_error());
        assert!(StatusCode::Config.is_client_error());
        assert!(!StatusCode::Io.is_client_error());
    }

    #[test]
    fn test_from_try_from_u32() {
        assert_eq!(StatusCode::from_u32(6005), Some(StatusCode::PublishTimeout));
        assert_eq!(StatusCode::from_u32(42), None);
        let code: u32 = StatusCode::LookupFailed.into();
        assert_eq!(code, 7000);
    }

    #[test]
    fn test_display_contains_name_and_code() {
        let s = StatusCode::ConnectTimeout.to_string();
        assert!(s.contains("ConnectTimeout"));
        assert!(s.contains("6003"));
    }
}
