use std::{future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use tracing::warn;

use crate::network::Message;

/// Обработчик сообщений потребителя.
///
/// Результат `handle_message` трактуется так:
/// - `Ok(true)`: сообщение обработано, при автоответе отправляется `FIN`;
/// - `Ok(false)` или `Err(_)`: обработка не удалась, при автоответе
///   сообщение возвращается в очередь (`REQ`).
///
/// Обработчик может ответить сам через [`Message::finish`] или
/// [`Message::requeue`], предварительно вызвав
/// [`Message::disable_auto_response`].
#[async_trait]
pub trait MsgHandler: Send + Sync {
    async fn handle_message(
        &self,
        msg: Arc<Message>,
    ) -> anyhow::Result<bool>;

    /// Вызывается для сообщения, превысившего `max_attempts`, перед тем
    /// как оно будет отброшено через `FIN`.
    fn log_failed_message(
        &self,
        msg: &Message,
    ) {
        warn!(
            id = %msg.id(),
            attempts = msg.attempts(),
            len = msg.body().len(),
            "message exceeded max attempts, dropping"
        );
    }
}

/// [`MsgHandler`] из асинхронного замыкания.
///
/// ```ignore
/// let handler = FnHandler::new(|msg| async move {
///     println!("{:?}", msg.body());
///     Ok(true)
/// });
/// ```
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> MsgHandler for FnHandler<F, Fut>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn handle_message(
        &self,
        msg: Arc<Message>,
    ) -> anyhow::Result<bool> {
        (self.f)(msg).await
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
