//! Потребитель: подписка на канал, управление кредитом RDY и backoff.
//!
//! Инвариант бюджета: сумма `RDY` по всем соединениям (`total_rdy`) не
//! превышает `max_in_flight`. Каждая выдача кредита проходит через
//! [`ConsumerInner::update_rdy`], которая урезает запрос до остатка
//! бюджета. Учёт RDY никогда не прерывается `.await`.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use nsqlink_error::{NsqError, NsqResult, StackError};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    handler::MsgHandler,
    lookup::{Lookup, LookupStats},
    lookupd::{Access, LookupdClient},
};
use crate::{
    backoff,
    config::NsqConfig,
    network::{
        validate_name, Command, ConnDelegate, ConnId, Connection, ConnectionSnapshot, Message,
        NsqdDelegate, RequeueDelay,
    },
    timer::Timers,
};

/// Доля последнего RDY в полёте, при которой соединение считается
/// голодающим.
const STARVED_RATIO: f64 = 0.85;
/// Повтор пробы, когда соединений нет.
const RESUME_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConsumerTimer {
    RdyRetry(ConnId),
    Resume,
    Redistribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Backoff,
    Continue,
    Resume,
}

#[derive(Debug, Default)]
struct RdyState {
    max_in_flight: u64,
    total_rdy: u64,
    backoff_counter: u32,
    /// Не ноль, пока взведён таймер пробы.
    backoff_duration: Duration,
    need_redistribute: bool,
}

impl RdyState {
    fn in_backoff(&self) -> bool {
        self.backoff_counter > 0
    }

    fn in_backoff_timeout(&self) -> bool {
        !self.backoff_duration.is_zero()
    }
}

/// Кредит на одно соединение: `clamp(max / n, 1, max)`, `0` без соединений.
pub fn per_conn_max_in_flight(
    max_in_flight: u64,
    conns: usize,
) -> u64 {
    if conns == 0 {
        return 0;
    }
    (max_in_flight / conns as u64).max(1).min(max_in_flight)
}

/// Статистика потребителя.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub topic: String,
    pub channel: String,
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub max_in_flight: u64,
    pub total_rdy: u64,
    pub backoff_level: u32,
    pub is_starved: bool,
    pub lookup: LookupStats,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Потребитель канала `topic/channel`.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    topic: String,
    channel: String,
    config: Arc<NsqConfig>,
    handler: Arc<dyn MsgHandler>,
    lookup: Lookup,
    rdy: Mutex<RdyState>,
    timers: Timers<ConsumerTimer>,
    stopped: AtomicBool,
    received: AtomicU64,
    finished: AtomicU64,
    requeued: AtomicU64,
    me: Weak<ConsumerInner>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Consumer {
    /// Создаёт потребителя и запускает периодическое перераспределение
    /// RDY. Вызывается внутри runtime tokio.
    ///
    /// # Параметры
    /// - `topic`, `channel`: проверяются до любого ввода-вывода.
    /// - `handler`: обработчик сообщений.
    /// - `max_in_flight`: общий бюджет RDY.
    /// - `config`, `client`: настройки и транспорт к lookupd.
    pub fn new(
        topic: &str,
        channel: &str,
        handler: Arc<dyn MsgHandler>,
        max_in_flight: u64,
        config: Arc<NsqConfig>,
        client: Arc<dyn LookupdClient>,
    ) -> NsqResult<Self> {
        validate_name(topic)?;
        validate_name(channel)?;
        let lookup = Lookup::new(topic, Access::Read, 1, Arc::clone(&config), client)?;

        let inner = Arc::new_cyclic(|me: &Weak<ConsumerInner>| {
            let conn_delegate: Weak<dyn ConnDelegate> = me.clone();
            let nsqd_delegate: Weak<dyn NsqdDelegate> = me.clone();
            lookup.set_delegates(conn_delegate, nsqd_delegate);
            ConsumerInner {
                topic: topic.to_string(),
                channel: channel.to_string(),
                config,
                handler,
                lookup,
                rdy: Mutex::new(RdyState {
                    max_in_flight,
                    ..RdyState::default()
                }),
                timers: Timers::new(),
                stopped: AtomicBool::new(false),
                received: AtomicU64::new(0),
                finished: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
                me: me.clone(),
            }
        });
        inner.start_redistribute_tick();
        info!(topic, channel, max_in_flight, "consumer created");
        Ok(Self { inner })
    }

    pub async fn connect_to_lookupd(
        &self,
        addr: &str,
    ) -> NsqResult<()> {
        self.inner.lookup.connect_to_lookupd(addr).await
    }

    pub async fn connect_to_lookupds<S: AsRef<str>>(
        &self,
        addrs: &[S],
    ) -> NsqResult<()> {
        for addr in addrs {
            self.connect_to_lookupd(addr.as_ref()).await?;
        }
        Ok(())
    }

    pub fn disconnect_from_lookupd(
        &self,
        addr: &str,
    ) -> NsqResult<()> {
        self.inner.lookup.disconnect_from_lookupd(addr)
    }

    /// Дополнительные поля `IDENTIFY` для соединений, открытых после
    /// вызова. Уже открытые соединения не меняются.
    pub fn set_extra_identify(
        &self,
        params: serde_json::Map<String, serde_json::Value>,
    ) {
        self.inner.lookup.set_extra_identify(params);
    }

    /// Прямое подключение к nsqd без lookupd.
    pub async fn connect_to_nsqd(
        &self,
        host: &str,
        port: u16,
    ) -> NsqResult<()> {
        self.inner.lookup.connect_to_nsqd(host, port).await.map(|_| ())
    }

    pub fn disconnect_from_nsqd(
        &self,
        host: &str,
        port: u16,
    ) -> NsqResult<()> {
        self.inner.lookup.disconnect_from_nsqd(host, port)
    }

    /// Меняет общий бюджет и перераспределяет кредит. `0` ставит
    /// потребление на паузу.
    pub fn change_max_in_flight(
        &self,
        max_in_flight: u64,
    ) {
        self.inner.change_max_in_flight(max_in_flight);
    }

    pub fn max_in_flight(&self) -> u64 {
        self.inner.rdy.lock().max_in_flight
    }

    /// Хотя бы одно живое соединение держит в полёте 85% и более от
    /// последнего выданного RDY.
    pub fn is_starved(&self) -> bool {
        self.inner.is_starved()
    }

    pub fn backoff_level(&self) -> u32 {
        self.inner.rdy.lock().backoff_counter
    }

    /// Сумма RDY, выданного всем соединениям.
    pub fn total_rdy(&self) -> u64 {
        self.inner.rdy.lock().total_rdy
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.lookup.connections()
    }

    pub fn stats(&self) -> ConsumerStats {
        let inner = &self.inner;
        let (max_in_flight, total_rdy, backoff_level) = {
            let rdy = inner.rdy.lock();
            (rdy.max_in_flight, rdy.total_rdy, rdy.backoff_counter)
        };
        ConsumerStats {
            topic: inner.topic.clone(),
            channel: inner.channel.clone(),
            messages_received: inner.received.load(Ordering::Relaxed),
            messages_finished: inner.finished.load(Ordering::Relaxed),
            messages_requeued: inner.requeued.load(Ordering::Relaxed),
            max_in_flight,
            total_rdy,
            backoff_level,
            is_starved: inner.is_starved(),
            lookup: inner.lookup.stats(),
            connections: inner
                .lookup
                .connections()
                .iter()
                .map(Connection::snapshot)
                .collect(),
        }
    }

    /// Останавливает опрос lookupd и перераспределение, мягко закрывает
    /// все соединения. Соединения с сообщениями в полёте закрываются
    /// принудительно через `delaying_close_time`.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Ждёт закрытия всех соединений.
    pub async fn wait_closed(&self) {
        for conn in self.inner.lookup.all_connections() {
            conn.closed().await;
        }
    }
}

impl ConsumerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.lookup.is_stopped()
    }

    fn start_redistribute_tick(&self) {
        let weak = self.me.clone();
        self.timers.tick(
            ConsumerTimer::Redistribute,
            self.config.rdy_redistribute_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.redistribute_rdy();
                    }
                }
            },
        );
    }

    fn change_max_in_flight(
        &self,
        max_in_flight: u64,
    ) {
        {
            let mut rdy = self.rdy.lock();
            if rdy.max_in_flight == max_in_flight {
                return;
            }
            rdy.max_in_flight = max_in_flight;
        }
        info!(topic = %self.topic, channel = %self.channel, max_in_flight, "max_in_flight changed");

        for conn in self.lookup.connections() {
            if max_in_flight == 0 {
                self.update_rdy(&conn, 0);
            } else {
                self.maybe_update_rdy(&conn);
            }
        }
    }

    fn is_starved(&self) -> bool {
        self.lookup.connections().iter().any(|conn| {
            let threshold = (conn.last_rdy() as f64 * STARVED_RATIO) as u64;
            let in_flight = conn.in_flight();
            in_flight > 0 && in_flight >= threshold && !conn.is_closing()
        })
    }

    fn next_backoff(
        &self,
        level: u32,
    ) -> Duration {
        backoff::from_config(level, &self.config.message_backoff)
    }

    /// Перевыдаёт кредит, если остаток мал или превышает текущую долю
    /// соединения. Ничего не делает во время backoff.
    fn maybe_update_rdy(
        &self,
        conn: &Connection,
    ) {
        let max_in_flight = {
            let rdy = self.rdy.lock();
            if rdy.in_backoff() || rdy.in_backoff_timeout() {
                return;
            }
            rdy.max_in_flight
        };

        let per_conn = per_conn_max_in_flight(max_in_flight, self.lookup.connection_count());
        let remain = conn.remaining_rdy();
        let last = conn.last_rdy();
        if remain <= 1 || remain * 4 < last || (per_conn > 0 && per_conn < remain) {
            self.update_rdy(conn, per_conn);
        }
    }

    /// Выдаёт соединению `count` кредита в пределах бюджета.
    ///
    /// Если бюджет исчерпан, а у соединения нет кредита, через
    /// `rdy_retry_delay` будет повторная попытка. Любая выдача кредита
    /// отменяет ожидающую попытку.
    fn update_rdy(
        &self,
        conn: &Connection,
        count: u64,
    ) {
        if conn.is_closing() {
            return;
        }
        let mut count = count.min(conn.max_rdy());
        let retry_key = ConsumerTimer::RdyRetry(conn.id());
        self.timers.cancel(&retry_key);

        let mut rdy = self.rdy.lock();
        let remain = conn.remaining_rdy();
        let max_possible = remain as i64 + rdy.max_in_flight as i64 - rdy.total_rdy as i64;
        if max_possible > 0 && (max_possible as u64) < count {
            count = max_possible as u64;
        }
        if max_possible <= 0 {
            if remain == 0 && count > 0 {
                debug!(addr = %conn.addr(), count, "rdy budget exhausted, retry scheduled");
                self.schedule_rdy_retry(conn, count, retry_key);
            }
            count = 0;
        }
        self.send_rdy(&mut rdy, conn, count);
    }

    fn schedule_rdy_retry(
        &self,
        conn: &Connection,
        count: u64,
        key: ConsumerTimer,
    ) {
        let weak = self.me.clone();
        let conn = conn.clone();
        self.timers
            .after(key, self.config.rdy_retry_delay(), async move {
                if let Some(inner) = weak.upgrade() {
                    inner.update_rdy(&conn, count);
                }
            });
    }

    fn send_rdy(
        &self,
        rdy: &mut RdyState,
        conn: &Connection,
        count: u64,
    ) {
        if count == 0 && conn.last_rdy() == 0 {
            return;
        }
        let remain = conn.set_rdy(count);
        rdy.total_rdy = (rdy.total_rdy + count).saturating_sub(remain);
        debug!(addr = %conn.addr(), rdy = count, total = rdy.total_rdy, "RDY");
        if let Err(e) = conn.write_cmd(Command::rdy(count)) {
            debug!(addr = %conn.addr(), error = %e, "RDY not sent");
        }
    }

    /// Автомат backoff. Сигналы игнорируются, пока взведён таймер пробы.
    fn on_signal(
        &self,
        signal: Signal,
    ) {
        enum Action {
            Exit,
            Enter(u32, Duration),
        }

        let action = {
            let mut rdy = self.rdy.lock();
            if rdy.in_backoff_timeout() {
                return;
            }
            let mut updated = false;
            match signal {
                Signal::Resume if rdy.backoff_counter > 0 => {
                    rdy.backoff_counter -= 1;
                    updated = true;
                }
                Signal::Backoff => {
                    let next = self.next_backoff(rdy.backoff_counter + 1);
                    if next <= self.config.max_backoff_duration() {
                        rdy.backoff_counter += 1;
                        updated = true;
                    }
                }
                _ => {}
            }

            if rdy.backoff_counter == 0 && updated {
                Action::Exit
            } else if rdy.backoff_counter > 0 {
                let delay = self
                    .next_backoff(rdy.backoff_counter)
                    .min(self.config.max_backoff_duration());
                rdy.backoff_duration = delay;
                Action::Enter(rdy.backoff_counter, delay)
            } else {
                return;
            }
        };

        let conns = self.lookup.connections();
        match action {
            Action::Exit => {
                let max_in_flight = self.rdy.lock().max_in_flight;
                let count = per_conn_max_in_flight(max_in_flight, conns.len());
                info!(topic = %self.topic, channel = %self.channel, rdy = count, "exiting backoff");
                for conn in &conns {
                    self.update_rdy(conn, count);
                }
            }
            Action::Enter(level, delay) => {
                info!(
                    topic = %self.topic,
                    channel = %self.channel,
                    level,
                    delay_ms = delay.as_millis() as u64,
                    "backing off, setting all to RDY 0"
                );
                for conn in &conns {
                    self.update_rdy(conn, 0);
                }
                self.schedule_resume(delay);
            }
        }
    }

    fn schedule_resume(
        &self,
        delay: Duration,
    ) {
        let weak = self.me.clone();
        self.timers
            .after(ConsumerTimer::Resume, delay, async move {
                if let Some(inner) = weak.upgrade() {
                    inner.resume();
                }
            });
    }

    /// Проба после паузы: один случайный канал получает RDY 1.
    fn resume(&self) {
        if self.is_stopped() {
            self.rdy.lock().backoff_duration = Duration::ZERO;
            return;
        }
        let conns = self.lookup.connections();
        let Some(choice) = conns.choose(&mut rand::thread_rng()) else {
            debug!(topic = %self.topic, "no connection to probe, retrying in 1s");
            self.rdy.lock().backoff_duration = RESUME_RETRY;
            self.schedule_resume(RESUME_RETRY);
            return;
        };
        debug!(addr = %choice.addr(), "backoff probe, RDY 1");
        self.update_rdy(choice, 1);
        self.rdy.lock().backoff_duration = Duration::ZERO;
    }

    /// Шаг периодического перераспределения кредита.
    fn redistribute_rdy(&self) {
        let conns = self.lookup.connections();
        let in_backoff = {
            let mut rdy = self.rdy.lock();
            if rdy.in_backoff_timeout() || conns.is_empty() {
                return;
            }
            if conns.len() as u64 > rdy.max_in_flight {
                rdy.need_redistribute = true;
            }
            if rdy.in_backoff() && conns.len() > 1 {
                rdy.need_redistribute = true;
            }
            if !rdy.need_redistribute {
                return;
            }
            rdy.need_redistribute = false;
            rdy.in_backoff()
        };

        let idle_timeout = self.config.low_rdy_idle_timeout();
        for conn in &conns {
            let idle = conn
                .last_message_at()
                .map_or(true, |at| at.elapsed() > idle_timeout);
            if conn.remaining_rdy() > 0 && idle {
                debug!(addr = %conn.addr(), "idle connection, revoking RDY");
                self.update_rdy(conn, 0);
            }
        }

        let mut available = {
            let rdy = self.rdy.lock();
            let budget = if in_backoff { 1 } else { rdy.max_in_flight as i64 };
            budget - rdy.total_rdy as i64
        };
        let mut candidates = conns;
        candidates.shuffle(&mut rand::thread_rng());
        for conn in candidates {
            if available <= 0 {
                break;
            }
            available -= 1;
            self.update_rdy(&conn, 1);
        }
    }

    async fn process_message(
        &self,
        conn: Connection,
        msg: Arc<Message>,
    ) {
        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && msg.attempts() > max_attempts {
            warn!(id = %msg.id(), attempts = msg.attempts(), "giving up on message");
            self.handler.log_failed_message(&msg);
            msg.finish();
        } else {
            match self.handler.handle_message(Arc::clone(&msg)).await {
                Ok(true) => {
                    if msg.is_auto_response() {
                        msg.finish();
                    }
                }
                Ok(false) => {
                    if msg.is_auto_response() {
                        msg.requeue(RequeueDelay::Auto, self.config.enable_backoff);
                    }
                }
                Err(e) => {
                    warn!(id = %msg.id(), error = %e, "handler failed, requeueing");
                    msg.requeue(RequeueDelay::Auto, self.config.enable_backoff);
                }
            }
        }
        self.maybe_update_rdy(&conn);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lookup.stop();
        self.timers.cancel_all();
        self.rdy.lock().backoff_duration = Duration::ZERO;

        let conns = self.lookup.connections();
        info!(
            topic = %self.topic,
            channel = %self.channel,
            connections = conns.len(),
            "stopping consumer"
        );
        for conn in conns {
            conn.try_close(false);
        }
    }
}

impl NsqdDelegate for ConsumerInner {
    fn on_connect(
        &self,
        conn: &Connection,
    ) {
        info!(addr = %conn.addr(), topic = %self.topic, channel = %self.channel, "subscribing");
        let sub = match Command::sub(&self.topic, &self.channel) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "invalid SUB");
                return;
            }
        };
        if let Err(e) = conn.write_cmd(sub) {
            warn!(addr = %conn.addr(), error = %e, "SUB not sent");
            return;
        }
        self.maybe_update_rdy(conn);
    }
}

impl ConnDelegate for ConsumerInner {
    fn on_response(
        &self,
        conn: &Connection,
        body: Bytes,
    ) {
        debug!(addr = %conn.addr(), body = %String::from_utf8_lossy(&body), "response");
    }

    fn on_error(
        &self,
        conn: &Connection,
        err: NsqError,
    ) {
        debug!(addr = %conn.addr(), error = %err, "consumer got error frame");
    }

    fn on_message(
        &self,
        conn: &Connection,
        msg: Arc<Message>,
        credited: bool,
    ) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if credited {
            let mut rdy = self.rdy.lock();
            rdy.total_rdy = rdy.total_rdy.saturating_sub(1);
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let conn = conn.clone();
        tokio::spawn(async move {
            inner.process_message(conn, msg).await;
        });
    }

    fn on_message_finished(
        &self,
        _conn: &Connection,
        _msg: &Message,
    ) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    fn on_message_requeued(
        &self,
        _conn: &Connection,
        _msg: &Message,
    ) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    fn on_backoff(
        &self,
        _conn: &Connection,
    ) {
        self.on_signal(Signal::Backoff);
    }

    fn on_continue(
        &self,
        _conn: &Connection,
    ) {
        self.on_signal(Signal::Continue);
    }

    fn on_resume(
        &self,
        _conn: &Connection,
    ) {
        self.on_signal(Signal::Resume);
    }

    fn on_io_error(
        &self,
        conn: &Connection,
        err: &StackError,
    ) {
        warn!(addr = %conn.addr(), error = %err, "consumer connection failed");
    }

    fn on_heartbeat(
        &self,
        _conn: &Connection,
    ) {
    }

    fn on_close(
        &self,
        conn: &Connection,
    ) {
        let remain = conn.remaining_rdy();
        let had_retry = self.timers.cancel(&ConsumerTimer::RdyRetry(conn.id()));
        self.lookup.remove_connection(conn);
        let left = self.lookup.connection_count();
        {
            let mut rdy = self.rdy.lock();
            rdy.total_rdy = rdy.total_rdy.saturating_sub(remain);
            if (had_retry || remain > 0) && (left as u64 == rdy.max_in_flight || rdy.in_backoff()) {
                rdy.need_redistribute = true;
            }
        }
        info!(addr = %conn.addr(), left, "consumer connection closed");

        if self.is_stopped() {
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let conn = conn.clone();
        tokio::spawn(async move {
            inner.lookup.reconnect(&conn).await;
            for conn in inner.lookup.connections() {
                inner.maybe_update_rdy(&conn);
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use nsqlink_error::StatusCode;
    use proptest::prelude::*;
    use rstest::rstest;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        client::{handler::FnHandler, lookupd::LookupData},
        network::{connection::Outbound, Frame, FrameType, MessageId},
    };

    struct NoLookupd;

    #[async_trait]
    impl LookupdClient for NoLookupd {
        async fn lookup(
            &self,
            addr: &str,
            _topic: &str,
            _access: Access,
        ) -> NsqResult<LookupData> {
            Err(NsqError::Lookup {
                addr: addr.to_string(),
                reason: "offline".to_string(),
            }
            .into())
        }
    }

    /// Обработчик: тело `ok` успешно, всё остальное неудача.
    fn body_handler() -> Arc<dyn MsgHandler> {
        Arc::new(FnHandler::new(|msg: Arc<Message>| async move {
            Ok::<_, anyhow::Error>(msg.body()[..] == b"ok"[..])
        }))
    }

    /// Обработчик, который никогда не отвечает: сообщения остаются в полёте.
    fn stalled_handler() -> Arc<dyn MsgHandler> {
        Arc::new(FnHandler::new(|_msg: Arc<Message>| async {
            std::future::pending::<anyhow::Result<bool>>().await
        }))
    }

    fn consumer_with(
        handler: Arc<dyn MsgHandler>,
        max_in_flight: u64,
        config: NsqConfig,
    ) -> Consumer {
        Consumer::new(
            "orders",
            "billing",
            handler,
            max_in_flight,
            Arc::new(config),
            Arc::new(NoLookupd),
        )
        .unwrap()
    }

    fn consumer(max_in_flight: u64) -> Consumer {
        consumer_with(body_handler(), max_in_flight, NsqConfig::default())
    }

    /// Настройки без периодического перераспределения: тест вызывает его сам.
    fn manual_redistribute() -> NsqConfig {
        NsqConfig {
            rdy_redistribute_interval: 3_600_000,
            ..NsqConfig::default()
        }
    }

    /// Подключает мок-соединение так, как это делает пул.
    fn attach(
        consumer: &Consumer,
        port: u16,
    ) -> (Connection, UnboundedReceiver<Outbound>) {
        let (conn, rx) = Connection::mock("127.0.0.1", port, Arc::clone(&consumer.inner.config));
        let delegate: Weak<dyn ConnDelegate> = consumer.inner.me.clone();
        conn.set_delegate(delegate);
        consumer.inner.lookup.adopt(&conn);
        consumer.inner.on_connect(&conn);
        (conn, rx)
    }

    /// Два прохода `maybe_update_rdy`: первый освобождает лишний кредит,
    /// второй раздаёт его соединениям, которым не хватило бюджета.
    fn rebalance(consumer: &Consumer) {
        for _ in 0..2 {
            for conn in consumer.connections() {
                consumer.inner.maybe_update_rdy(&conn);
            }
        }
    }

    fn granted(consumer: &Consumer) -> u64 {
        consumer
            .connections()
            .iter()
            .map(Connection::remaining_rdy)
            .sum()
    }

    fn sent(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Data(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    out.push(text.trim_end_matches('\n').to_string());
                }
                Outbound::Close => out.push("<close>".to_string()),
            }
        }
        out
    }

    fn message_frame(
        id: u8,
        attempts: u16,
        body: &'static str,
    ) -> Frame {
        let msg = Message::new(MessageId::new([id; 16]), attempts, body);
        Frame::new(FrameType::Message, msg.encode(false))
    }

    /// Даёт отработать задачам обработки сообщений.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[rstest]
    #[case(2500, 0, 0)]
    #[case(2500, 1, 2500)]
    #[case(2500, 3, 833)]
    #[case(2, 5, 1)]
    #[case(0, 3, 0)]
    fn test_per_conn_max_in_flight(
        #[case] max: u64,
        #[case] conns: usize,
        #[case] expected: u64,
    ) {
        assert_eq!(per_conn_max_in_flight(max, conns), expected);
    }

    #[tokio::test]
    async fn test_rejects_invalid_channel() {
        let err = Consumer::new(
            "orders",
            "bad channel!",
            body_handler(),
            1,
            Arc::new(NsqConfig::default()),
            Arc::new(NoLookupd),
        )
        .err()
        .unwrap();
        assert_eq!(err.status_code(), StatusCode::InvalidName);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes_and_grants_rdy() {
        let consumer = consumer(2500);
        let (conn, mut rx) = attach(&consumer, 4150);
        assert_eq!(sent(&mut rx), ["SUB orders billing", "RDY 2500"]);
        assert_eq!(conn.remaining_rdy(), 2500);
        assert_eq!(consumer.total_rdy(), 2500);
        consumer.stop();
    }

    /// Тест проверяет сценарий backoff на единственном соединении:
    /// неудача обнуляет RDY и взводит пробу, проба выдаёт RDY 1 тому же
    /// соединению, успех пробы возвращает полный кредит.
    #[tokio::test(start_paused = true)]
    async fn test_backoff_probe_and_exit() {
        let consumer = consumer(2500);
        let (conn, mut rx) = attach(&consumer, 4150);
        sent(&mut rx);

        conn.inject(message_frame(1, 1, "fail"));
        settle().await;
        assert_eq!(consumer.backoff_level(), 1);
        assert_eq!(conn.last_rdy(), 0);
        assert_eq!(consumer.total_rdy(), 0);
        let wire = sent(&mut rx);
        assert_eq!(wire[0], "RDY 0");
        assert!(wire[1].starts_with("REQ "));
        assert!(consumer.inner.timers.contains(&ConsumerTimer::Resume));

        tokio::time::sleep(consumer.inner.config.max_backoff_duration()).await;
        settle().await;
        assert_eq!(sent(&mut rx), ["RDY 1"]);
        assert_eq!(conn.remaining_rdy(), 1);
        assert_eq!(consumer.total_rdy(), 1);

        conn.inject(message_frame(2, 1, "ok"));
        settle().await;
        assert_eq!(consumer.backoff_level(), 0);
        let wire = sent(&mut rx);
        assert_eq!(wire[0], "RDY 2500");
        assert!(wire[1].starts_with("FIN "));
        assert_eq!(consumer.total_rdy(), 2500);

        let stats = consumer.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.messages_finished, 1);
        assert_eq!(stats.messages_requeued, 1);
        consumer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_over_max_attempts_is_finished() {
        let consumer = consumer(10);
        let (conn, mut rx) = attach(&consumer, 4150);
        sent(&mut rx);

        conn.inject(message_frame(1, 6, "fail"));
        settle().await;
        let wire = sent(&mut rx);
        assert!(wire[0].starts_with("FIN "));
        assert_eq!(consumer.backoff_level(), 0);
        assert_eq!(conn.in_flight(), 0);
        consumer.stop();
    }

    /// Тест проверяет, что новое соединение при исчерпанном бюджете не
    /// получает кредит сразу, а забирает освободившийся после повтора.
    #[tokio::test(start_paused = true)]
    async fn test_new_connection_waits_for_budget() {
        let consumer = consumer(10);
        let (a, mut rx_a) = attach(&consumer, 4150);
        assert_eq!(a.remaining_rdy(), 10);

        let (b, mut rx_b) = attach(&consumer, 4151);
        assert_eq!(sent(&mut rx_b), ["SUB orders billing"]);
        assert!(consumer
            .inner
            .timers
            .contains(&ConsumerTimer::RdyRetry(b.id())));

        consumer.inner.maybe_update_rdy(&a);
        assert_eq!(a.remaining_rdy(), 5);
        assert_eq!(sent(&mut rx_a).last().map(String::as_str), Some("RDY 5"));

        tokio::time::sleep(consumer.inner.config.rdy_retry_delay()).await;
        settle().await;
        assert_eq!(sent(&mut rx_b), ["RDY 5"]);
        assert_eq!(consumer.total_rdy(), 10);
        consumer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_max_in_flight_zero_pauses() {
        let consumer = consumer(10);
        let (conn, mut rx) = attach(&consumer, 4150);
        sent(&mut rx);

        consumer.change_max_in_flight(0);
        assert_eq!(sent(&mut rx), ["RDY 0"]);
        assert_eq!(consumer.total_rdy(), 0);

        consumer.change_max_in_flight(4);
        assert_eq!(sent(&mut rx), ["RDY 4"]);
        assert_eq!(conn.remaining_rdy(), 4);
        consumer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_returns_credit() {
        let consumer = consumer(10);
        let (conn, _rx) = attach(&consumer, 4150);
        assert_eq!(consumer.total_rdy(), 10);

        consumer.stop();
        assert!(conn.is_closing());
        assert_eq!(consumer.total_rdy(), 0);
        assert!(consumer.connections().is_empty());
        consumer.wait_closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_starved() {
        let consumer = consumer_with(stalled_handler(), 2, NsqConfig::default());
        let (conn, _rx) = attach(&consumer, 4150);
        assert!(!consumer.is_starved());

        conn.inject(message_frame(1, 1, "a"));
        conn.inject(message_frame(2, 1, "b"));
        assert!(consumer.is_starved());
        consumer.stop();
    }

    /// Тест проверяет, что сообщения, пришедшие после `RDY 0`, не
    /// уменьшают общий счётчик: он остаётся равен сумме кредита по
    /// соединениям и после подключения нового соединения.
    #[tokio::test(start_paused = true)]
    async fn test_total_rdy_survives_messages_after_rdy_zero() {
        let consumer = consumer_with(stalled_handler(), 4, NsqConfig::default());
        let (a, _rx_a) = attach(&consumer, 4150);
        let (b, _rx_b) = attach(&consumer, 4151);
        rebalance(&consumer);
        assert_eq!((a.remaining_rdy(), b.remaining_rdy()), (2, 2));
        assert_eq!(consumer.total_rdy(), 4);

        consumer.inner.update_rdy(&a, 0);
        for id in 1..=3 {
            a.inject(message_frame(id, 1, "late"));
        }
        assert_eq!(a.in_flight(), 3);
        assert_eq!(granted(&consumer), 2);
        assert_eq!(consumer.total_rdy(), 2);

        let (_c, _rx_c) = attach(&consumer, 4152);
        rebalance(&consumer);
        assert_eq!(granted(&consumer), consumer.total_rdy());
        assert!(consumer.total_rdy() <= 4);
        consumer.stop();
    }

    /// Тест проверяет, что вход в backoff обнуляет RDY на каждом
    /// соединении, а выход возвращает каждому долю `max_in_flight`.
    #[tokio::test(start_paused = true)]
    async fn test_backoff_covers_every_connection() {
        let consumer = consumer_with(stalled_handler(), 9, manual_redistribute());
        let mut attached: Vec<_> = (0..3).map(|i| attach(&consumer, 4150 + i)).collect();
        rebalance(&consumer);
        for (conn, rx) in &mut attached {
            assert_eq!(conn.remaining_rdy(), 3);
            sent(rx);
        }

        consumer.inner.on_signal(Signal::Backoff);
        assert_eq!(consumer.backoff_level(), 1);
        assert_eq!(consumer.total_rdy(), 0);
        for (conn, rx) in &mut attached {
            assert_eq!(sent(rx), ["RDY 0"]);
            assert_eq!(conn.remaining_rdy(), 0);
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(granted(&consumer), 1);
        assert_eq!(consumer.total_rdy(), 1);

        consumer.inner.on_signal(Signal::Resume);
        assert_eq!(consumer.backoff_level(), 0);
        for (conn, rx) in &mut attached {
            assert_eq!(conn.remaining_rdy(), 3);
            assert_eq!(sent(rx).last().map(String::as_str), Some("RDY 3"));
        }
        assert_eq!(consumer.total_rdy(), 9);
        consumer.stop();
    }

    /// Тест проверяет, что сигналы не меняют уровень backoff, пока
    /// взведён таймер пробы.
    #[tokio::test(start_paused = true)]
    async fn test_signals_ignored_while_resume_pending() {
        let consumer = consumer_with(stalled_handler(), 4, manual_redistribute());
        let (_a, mut rx_a) = attach(&consumer, 4150);
        let (_b, mut rx_b) = attach(&consumer, 4151);
        rebalance(&consumer);

        consumer.inner.on_signal(Signal::Backoff);
        assert_eq!(consumer.backoff_level(), 1);
        sent(&mut rx_a);
        sent(&mut rx_b);

        consumer.inner.on_signal(Signal::Backoff);
        consumer.inner.on_signal(Signal::Resume);
        consumer.inner.on_signal(Signal::Continue);
        assert_eq!(consumer.backoff_level(), 1);
        assert!(sent(&mut rx_a).is_empty());
        assert!(sent(&mut rx_b).is_empty());
        assert_eq!(consumer.total_rdy(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        consumer.inner.on_signal(Signal::Resume);
        assert_eq!(consumer.backoff_level(), 0);
        assert_eq!(consumer.total_rdy(), 4);
        consumer.stop();
    }

    /// Тест проверяет, что уровень backoff не растёт дальше шага, задержка
    /// которого превысила бы `max_backoff_duration`. С настройками по
    /// умолчанию базовая задержка шестого шага 64 с при потолке 60 с.
    #[tokio::test(start_paused = true)]
    async fn test_backoff_level_stops_at_max_duration() {
        let consumer = consumer_with(stalled_handler(), 4, manual_redistribute());
        let (a, _rx_a) = attach(&consumer, 4150);
        let (b, _rx_b) = attach(&consumer, 4151);
        let max_backoff = consumer.inner.config.max_backoff_duration();

        for level in [1, 2, 3, 4, 5, 5, 5] {
            consumer.inner.on_signal(Signal::Backoff);
            assert_eq!(consumer.backoff_level(), level);
            assert_eq!(a.remaining_rdy(), 0);
            assert_eq!(b.remaining_rdy(), 0);
            assert!(consumer.inner.rdy.lock().backoff_duration <= max_backoff);
            assert!(consumer.inner.timers.contains(&ConsumerTimer::Resume));

            tokio::time::sleep(max_backoff).await;
            settle().await;
            assert_eq!(granted(&consumer), 1);
        }
        consumer.stop();
    }

    /// Тест проверяет, что перераспределение отбирает кредит у простаивающих
    /// соединений, когда соединений больше, чем `max_in_flight`, и не трогает
    /// соединение, недавно получившее сообщение.
    #[tokio::test(start_paused = true)]
    async fn test_redistribute_revokes_idle_credit() {
        let consumer = consumer_with(stalled_handler(), 2, manual_redistribute());
        let (a, mut rx_a) = attach(&consumer, 4150);
        let (b, mut rx_b) = attach(&consumer, 4151);
        let (_c, _rx_c) = attach(&consumer, 4152);
        assert_eq!(a.remaining_rdy(), 2);

        a.inject(message_frame(1, 1, "busy"));
        consumer.inner.update_rdy(&b, 1);
        assert_eq!((a.remaining_rdy(), b.remaining_rdy()), (1, 1));
        assert_eq!(consumer.total_rdy(), 2);
        sent(&mut rx_a);
        sent(&mut rx_b);

        consumer.inner.redistribute_rdy();
        assert_eq!(sent(&mut rx_b).first().map(String::as_str), Some("RDY 0"));
        assert!(!sent(&mut rx_a).iter().any(|cmd| cmd == "RDY 0"));
        assert_eq!(a.remaining_rdy(), 1);
        assert_eq!(granted(&consumer), consumer.total_rdy());
        assert!(consumer.total_rdy() <= 2);
        consumer.stop();
    }

    /// Тест проверяет, что в backoff перераспределение держит в сумме не
    /// больше одной единицы кредита.
    #[tokio::test(start_paused = true)]
    async fn test_redistribute_in_backoff_grants_single_credit() {
        let consumer = consumer_with(stalled_handler(), 9, manual_redistribute());
        let _attached: Vec<_> = (0..3).map(|i| attach(&consumer, 4150 + i)).collect();
        rebalance(&consumer);
        assert_eq!(consumer.total_rdy(), 9);

        consumer.inner.on_signal(Signal::Backoff);
        consumer.inner.redistribute_rdy();
        assert_eq!(consumer.total_rdy(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(consumer.total_rdy(), 1);

        for _ in 0..3 {
            consumer.inner.redistribute_rdy();
            let credited: Vec<u64> = consumer
                .connections()
                .iter()
                .map(Connection::remaining_rdy)
                .filter(|&rdy| rdy > 0)
                .collect();
            assert_eq!(credited, [1]);
            assert_eq!(consumer.total_rdy(), 1);
        }
        consumer.stop();
    }

    /// Тест проверяет, что без backoff и при достаточном бюджете
    /// перераспределение ничего не отправляет.
    #[tokio::test(start_paused = true)]
    async fn test_redistribute_skipped_when_budget_covers_connections() {
        let consumer = consumer_with(stalled_handler(), 9, manual_redistribute());
        let mut attached: Vec<_> = (0..3).map(|i| attach(&consumer, 4150 + i)).collect();
        rebalance(&consumer);
        for (_, rx) in &mut attached {
            sent(rx);
        }

        consumer.inner.redistribute_rdy();
        for (conn, rx) in &mut attached {
            assert!(sent(rx).is_empty());
            assert_eq!(conn.remaining_rdy(), 3);
        }
        consumer.stop();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Close(usize),
        Message(usize),
        ChangeMax(u64),
        Redistribute,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Connect),
            1 => (0usize..8).prop_map(Op::Close),
            4 => (0usize..8).prop_map(Op::Message),
            1 => (1u64..20).prop_map(Op::ChangeMax),
            1 => Just(Op::Redistribute),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Сумма RDY по живым соединениям не превышает `max_in_flight`
        /// после любой последовательности операций.
        #[test]
        fn prop_rdy_budget_is_never_exceeded(
            max in 1u64..20,
            ops in proptest::collection::vec(op(), 1..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            rt.block_on(async {
                let consumer = consumer(max);
                let mut conns: Vec<(Connection, UnboundedReceiver<Outbound>)> = Vec::new();
                let mut next_port = 5000u16;
                let mut next_id = 0u8;

                for op in ops {
                    match op {
                        Op::Connect => {
                            conns.push(attach(&consumer, next_port));
                            next_port += 1;
                        }
                        Op::Close(i) if !conns.is_empty() => {
                            let (conn, _) = &conns[i % conns.len()];
                            conn.try_close(true);
                        }
                        Op::Message(i) if !conns.is_empty() => {
                            let (conn, _) = &conns[i % conns.len()];
                            next_id = next_id.wrapping_add(1);
                            conn.inject(message_frame(next_id, 1, "ok"));
                        }
                        Op::ChangeMax(n) => consumer.change_max_in_flight(n),
                        Op::Redistribute => {
                            consumer.inner.redistribute_rdy();
                            let live = consumer.connections();
                            if live.len() as u64 > consumer.max_in_flight() {
                                let untouched =
                                    live.iter().filter(|c| c.last_message_at().is_none());
                                for conn in untouched {
                                    prop_assert!(conn.remaining_rdy() <= 1);
                                }
                            }
                        }
                        _ => {}
                    }

                    let budget = consumer.max_in_flight();
                    let granted: u64 = consumer
                        .connections()
                        .iter()
                        .map(Connection::remaining_rdy)
                        .sum();
                    prop_assert!(granted <= budget, "granted {} > budget {}", granted, budget);
                    prop_assert_eq!(granted, consumer.total_rdy());
                }
                consumer.stop();
                Ok(())
            })?;
        }
    }
}
