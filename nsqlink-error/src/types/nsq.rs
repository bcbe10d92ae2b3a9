use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки NSQ-клиента.
#[derive(Debug, Clone, Error)]
pub enum NsqError {
    /// Имя топика или канала не соответствует `^[.a-zA-Z0-9_-]{2,64}$`.
    #[error("invalid topic/channel name: {name:?}")]
    InvalidName { name: String },

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Пользовательский параметр расширения не может начинаться с `##`.
    #[error("reserved message param name: {name:?}")]
    InvalidMessageParam { name: String },

    #[error("no messages to publish")]
    EmptyMessages,

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Неверный кадр, сообщение или неожиданный ответ на рукопожатие.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("frame of {size} bytes exceeds limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Тело кадра `FrameTypeError` от nsqd.
    #[error("nsqd error {code}: {message}")]
    Server { code: String, message: String },

    #[error("io error: {reason}")]
    Io { reason: String },

    #[error("connection to {addr} closed")]
    ConnectionClosed { addr: String },

    #[error("publish to {addr} timed out")]
    PublishTimeout { addr: String },

    /// На соединении уже висит незавершённая публикация.
    #[error("publish already in flight on {addr}")]
    PublishInFlight { addr: String },

    #[error("lookupd {addr} query failed: {reason}")]
    Lookup { addr: String, reason: String },

    #[error("no lookupd address registered")]
    NoLookupd,

    #[error("no nsqd available for topic {topic}")]
    NotConnected { topic: String },

    #[error("client is stopped")]
    Stopped,

    #[error("config error: {reason}")]
    Config { reason: String },
}

impl NsqError {
    /// Разбирает тело кадра ошибки (`E_BAD_TOPIC some text`).
    pub fn server(body: &[u8]) -> Self {
        let message = String::from_utf8_lossy(body).trim().to_string();
        let code = message
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        Self::Server { code, message }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Ответ nsqd `E_BAD_TOPIC`: топология, скорее всего, устарела.
    pub fn is_bad_topic(&self) -> bool {
        matches!(self, Self::Server { code, .. } if code == "E_BAD_TOPIC")
    }
}

impl ErrorExt for NsqError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidName { .. } => StatusCode::InvalidName,
            Self::InvalidAddress { .. } => StatusCode::InvalidAddress,
            Self::InvalidMessageParam { .. } => StatusCode::InvalidMessageParam,
            Self::EmptyMessages => StatusCode::EmptyMessages,
            Self::ConnectTimeout { .. } => StatusCode::ConnectTimeout,
            Self::ConnectionFailed { .. } => StatusCode::ConnectionFailed,
            Self::Protocol { .. } => StatusCode::ProtocolError,
            Self::FrameTooLarge { .. } => StatusCode::FrameTooLarge,
            Self::Server { .. } => StatusCode::ServerError,
            Self::Io { .. } => StatusCode::Io,
            Self::ConnectionClosed { .. } => StatusCode::ConnectionClosed,
            Self::PublishTimeout { .. } => StatusCode::PublishTimeout,
            Self::PublishInFlight { .. } => StatusCode::PublishInFlight,
            Self::Lookup { .. } => StatusCode::LookupFailed,
            Self::NoLookupd | Self::NotConnected { .. } => StatusCode::NotConnected,
            Self::Stopped => StatusCode::Stopped,
            Self::Config { .. } => StatusCode::Config,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn addr(&self) -> Option<&str> {
        match self {
            Self::ConnectTimeout { addr }
            | Self::ConnectionFailed { addr, .. }
            | Self::ConnectionClosed { addr }
            | Self::PublishTimeout { addr }
            | Self::PublishInFlight { addr }
            | Self::Lookup { addr, .. }
            | Self::InvalidAddress { addr, .. } => Some(addr.as_str()),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет разбор кода ошибки nsqd из тела кадра.
    #[test]
    fn test_server_error_parses_code() {
        let err = NsqError::server(b"E_BAD_TOPIC PUB topic name \"x\" is not valid");
        assert!(err.is_bad_topic());
        match &err {
            NsqError::Server { code, message } => {
                assert_eq!(code, "E_BAD_TOPIC");
                assert!(message.contains("not valid"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(err.status_code(), StatusCode::ServerError);
    }

    #[test]
    fn test_server_error_other_code_is_not_bad_topic() {
        let err = NsqError::server(b"E_INVALID cannot FIN in current state");
        assert!(!err.is_bad_topic());
    }

    #[test]
    fn test_addr_of_network_errors() {
        let err = NsqError::PublishTimeout {
            addr: "10.0.0.1:4150".to_string(),
        };
        assert_eq!(err.addr(), Some("10.0.0.1:4150"));
        assert_eq!(NsqError::NoLookupd.addr(), None);
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        let err = NsqError::InvalidName {
            name: "!".to_string(),
        };
        assert!(!err.status_code().is_retryable());
        assert!(err.status_code().is_client_error());
    }
}
