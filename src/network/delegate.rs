//! Интерфейсы обратных вызовов между соединением и его владельцем.
//!
//! Соединение ничего не решает само: все события уходят делегату
//! ([`ConnDelegate`]), а FIN/REQ/TOUCH сообщения возвращаются в соединение
//! через [`MsgDelegate`]. Потребитель и продюсер реализуют полный набор
//! методов; события, которые им не нужны, обрабатываются пустым телом.

use std::sync::Arc;

use bytes::Bytes;
use nsqlink_error::{NsqError, StackError};
use tracing::trace;

use super::{
    connection::Connection,
    nsq::{Command, Frame, Message, RequeueDelay},
};

/// События соединения, готового к работе.
///
/// Методы вызываются синхронно из задачи чтения соединения или из кода,
/// ответившего на сообщение, поэтому не должны блокироваться.
pub trait ConnDelegate: Send + Sync {
    /// Кадр `Response`, кроме heartbeat и `CLOSE_WAIT`.
    fn on_response(
        &self,
        conn: &Connection,
        body: Bytes,
    );

    /// Кадр `Error` от nsqd.
    fn on_error(
        &self,
        conn: &Connection,
        err: NsqError,
    );

    /// Новое сообщение. Учёт RDY и in-flight к этому моменту уже обновлён.
    /// `credited` ложно, если у соединения не оставалось кредита.
    fn on_message(
        &self,
        conn: &Connection,
        msg: Arc<Message>,
        credited: bool,
    );

    fn on_message_finished(
        &self,
        conn: &Connection,
        msg: &Message,
    );

    fn on_message_requeued(
        &self,
        conn: &Connection,
        msg: &Message,
    );

    /// Сообщение возвращено в очередь с запросом backoff.
    fn on_backoff(
        &self,
        conn: &Connection,
    );

    /// Сообщение возвращено в очередь без backoff.
    fn on_continue(
        &self,
        conn: &Connection,
    );

    /// Сообщение успешно обработано.
    fn on_resume(
        &self,
        conn: &Connection,
    );

    /// Ошибка транспорта или протокола. Вызывается перед [`Self::on_close`].
    fn on_io_error(
        &self,
        conn: &Connection,
        err: &StackError,
    );

    fn on_heartbeat(
        &self,
        conn: &Connection,
    );

    /// Соединение закрыто. Решение о переподключении за делегатом.
    fn on_close(
        &self,
        conn: &Connection,
    );

    /// Отладочный хук перед отправкой команды.
    fn on_send(
        &self,
        conn: &Connection,
        cmd: &Command,
    ) {
        trace!(addr = %conn.addr(), cmd = %cmd, "send");
    }

    /// Отладочный хук после чтения кадра.
    fn on_receive(
        &self,
        conn: &Connection,
        frame: &Frame,
    ) {
        trace!(
            addr = %conn.addr(),
            frame_type = ?frame.frame_type,
            len = frame.body.len(),
            "receive"
        );
    }
}

/// Ответы на сообщение, которые должно отправить соединение-владелец.
pub trait MsgDelegate: Send + Sync {
    fn on_finish(
        &self,
        msg: &Message,
    );

    fn on_requeue(
        &self,
        msg: &Message,
        delay: RequeueDelay,
        backoff: bool,
    );

    fn on_touch(
        &self,
        msg: &Message,
    );
}

/// Уведомление о новом готовом соединении с nsqd.
pub trait NsqdDelegate: Send + Sync {
    fn on_connect(
        &self,
        conn: &Connection,
    );
}
