use std::{any::Any, error::Error};

use crate::StatusCode;

/// Общий интерфейс ошибок клиента (object-safe).
///
/// [`StackError`](crate::StackError) хранит корневую ошибку как
/// `Arc<dyn ErrorExt>`, поэтому всё, что нужно знать о ней снаружи,
/// выражено методами этого трейта.
pub trait ErrorExt: Error + Send + Sync + 'static {
    /// Статус ошибки. По умолчанию [`StatusCode::Internal`].
    fn status_code(&self) -> StatusCode {
        StatusCode::Internal
    }

    fn as_any(&self) -> &dyn Any;

    /// Адрес nsqd или lookupd, к которому относится ошибка.
    fn addr(&self) -> Option<&str> {
        None
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[derive(Debug)]
    struct PlainError;

    impl fmt::Display for PlainError {
        fn fmt(
            &self,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            write!(f, "plain")
        }
    }

    impl Error for PlainError {}

    impl ErrorExt for PlainError {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Тест проверяет значения по умолчанию: статус `Internal`, без адреса.
    #[test]
    fn test_defaults() {
        let e = PlainError;
        assert_eq!(e.status_code(), StatusCode::Internal);
        assert_eq!(e.addr(), None);
        assert!(e.as_any().downcast_ref::<PlainError>().is_some());
    }
}
