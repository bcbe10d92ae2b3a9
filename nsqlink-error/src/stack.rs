use std::{fmt, panic::Location, sync::Arc};

use crate::{ErrorExt, NsqError, StatusCode};

/// Ошибка клиента: корневая причина и цепочка контекстов над ней.
///
/// Контексты добавляются по пути наверх (соединение, продюсер, реестр).
/// `Display` печатает их от внешнего к внутреннему, как `anyhow`:
/// `publish to topic orders: write to 127.0.0.1:4150: broken pipe`.
#[derive(Clone)]
pub struct StackError {
    root: Arc<dyn ErrorExt>,
    contexts: Arc<Vec<ErrorContext>>,
}

/// Одно звено контекста и место в коде, где оно добавлено.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub message: String,
    pub location: &'static Location<'static>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StackError {
    pub fn new<E: ErrorExt>(err: E) -> Self {
        Self {
            root: Arc::new(err),
            contexts: Arc::new(Vec::new()),
        }
    }

    /// Добавляет внешний контекст.
    #[track_caller]
    pub fn context(
        mut self,
        msg: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.contexts).push(ErrorContext {
            message: msg.into(),
            location: Location::caller(),
        });
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.root.status_code()
    }

    /// Адрес узла, на котором произошла корневая ошибка.
    pub fn addr(&self) -> Option<&str> {
        self.root.addr()
    }

    /// Контексты в порядке добавления: первым идёт самый внутренний.
    pub fn contexts(&self) -> &[ErrorContext] {
        &self.contexts
    }

    pub fn downcast_ref<T: ErrorExt>(&self) -> Option<&T> {
        self.root.as_any().downcast_ref::<T>()
    }

    /// Корневая ошибка, если это ошибка протокола или клиента NSQ.
    pub fn nsq(&self) -> Option<&NsqError> {
        self.downcast_ref::<NsqError>()
    }

    /// nsqd ответил `E_BAD_TOPIC`: топик не обслуживается этим узлом.
    pub fn is_bad_topic(&self) -> bool {
        self.nsq().is_some_and(NsqError::is_bad_topic)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StackError
////////////////////////////////////////////////////////////////////////////////

impl fmt::Debug for StackError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let mut debug = f.debug_struct("StackError");
        debug.field("root", &self.root.to_string());
        debug.field("status_code", &self.status_code());
        if let Some(addr) = self.addr() {
            debug.field("addr", &addr);
        }
        if !self.contexts.is_empty() {
            let trace: Vec<String> = self
                .contexts
                .iter()
                .map(|ctx| format!("{} at {}", ctx.message, ctx.location))
                .collect();
            debug.field("contexts", &trace);
        }
        debug.finish()
    }
}

impl fmt::Display for StackError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        for ctx in self.contexts.iter().rev() {
            write!(f, "{}: ", ctx.message)?;
        }
        write!(f, "{}", self.root)
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.root.as_ref())
    }
}

impl<E: ErrorExt> From<E> for StackError {
    fn from(e: E) -> Self {
        StackError::new(e)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
