use std::{fmt, time::Instant};

use serde::Serialize;

/// Состояние соединения с nsqd.
///
/// Переходы: `Init → Connecting → Identifying → Ready → (WaitingClose | Closed)`.
/// Из `Closed` выхода нет: закрытое соединение не переиспользуется.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Объект создан, сокет ещё не открыт
    Init,
    /// Идёт TCP-подключение под таймаутом
    Connecting,
    /// Отправлены magic и `IDENTIFY`, ждём первый кадр
    Identifying,
    /// Рабочее состояние
    Ready,
    /// Отправлен `CLS`, входящие кадры больше не принимаются
    WaitingClose,
    Closed,
}

impl ConnectionState {
    /// Соединение закрыто или закрывается.
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::WaitingClose | ConnectionState::Closed)
    }

    /// Соединение успело пройти рукопожатие.
    pub fn was_ready(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::WaitingClose)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            ConnectionState::Init => "init",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Ready => "ready",
            ConnectionState::WaitingClose => "waiting_close",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Счётчики кредита и сообщений в полёте.
///
/// Меняются только под одной блокировкой, чтобы `rdy` и `in_flight`
/// всегда наблюдались согласованными.
#[derive(Debug, Clone, Default)]
pub struct RdyCounters {
    /// Остаток кредита, ещё не израсходованный nsqd
    pub rdy: u64,
    /// Последний выданный RDY
    pub last_rdy: u64,
    /// Получено, но ещё не отправлен FIN/REQ
    pub in_flight: u64,
    pub last_message_at: Option<Instant>,
}

impl RdyCounters {
    /// Учёт входящего сообщения.
    ///
    /// # Возвращает
    /// `true`, если сообщение израсходовало кредит. Сообщение, пришедшее
    /// после `RDY 0`, кредит не тратит.
    pub fn message_received(&mut self) -> bool {
        let credited = self.rdy > 0;
        self.rdy = self.rdy.saturating_sub(1);
        self.in_flight += 1;
        self.last_message_at = Some(Instant::now());
        credited
    }

    /// Учёт FIN/REQ. Возвращает оставшееся число сообщений в полёте.
    pub fn message_done(&mut self) -> u64 {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.in_flight
    }

    /// Выставляет новый кредит. Возвращает неизрасходованный остаток
    /// прежнего.
    pub fn set_rdy(
        &mut self,
        count: u64,
    ) -> u64 {
        self.last_rdy = count;
        std::mem::replace(&mut self.rdy, count)
    }
}

/// Снимок соединения для статистики.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub addr: String,
    pub state: ConnectionState,
    pub rdy: u64,
    pub last_rdy: u64,
    pub in_flight: u64,
    pub busy: bool,
    pub disposable: bool,
    pub partition: Option<u32>,
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
