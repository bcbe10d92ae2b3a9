//! Соединение с одним nsqd.
//!
//! Соединение разбито на две задачи: чтение кадров и запись команд. Запись
//! идёт через неограниченный канал, поэтому [`Connection::write_cmd`]
//! синхронна и никогда не приостанавливает вызывающего. Это позволяет
//! обновлять учёт RDY без точек приостановки посередине.

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use nsqlink_error::{NsqError, NsqResult, StackError, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        lookup_host,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpSocket, TcpStream,
    },
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    connection_state::{ConnectionSnapshot, ConnectionState, RdyCounters},
    delegate::{ConnDelegate, MsgDelegate},
    nsq::{
        read_frame, Command, Frame, FrameType, IdentifyResponse, Message, RequeueDelay, MAGIC_V2,
    },
};
use crate::{backoff, config::NsqConfig, timer::Timers};

/// Идентификатор соединения, уникальный в пределах процесса.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Таймеры соединения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConnTimer {
    /// Принудительное закрытие после `CLS`, если сообщения не дообработаны
    DelayedClose,
    /// Время жизни одноразового соединения
    Lifetime,
}

/// Элемент очереди записи.
#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    Close,
}

/// Дескриптор соединения. Клонирование дешёвое: все копии указывают на
/// одно состояние.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: ConnId,
    host: String,
    port: u16,
    addr: String,
    config: Arc<NsqConfig>,
    extra_identify: Map<String, Value>,
    state: Mutex<ConnectionState>,
    counters: Mutex<RdyCounters>,
    busy: AtomicBool,
    disposable: AtomicBool,
    extend_support: AtomicBool,
    partition: Mutex<Option<u32>>,
    max_rdy: AtomicU64,
    negotiated: Mutex<Option<IdentifyResponse>>,
    delegate: RwLock<Option<Weak<dyn ConnDelegate>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timers: Timers<ConnTimer>,
    closed: watch::Sender<bool>,
    me: Weak<ConnectionInner>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Connection {
    /// Создаёт соединение в состоянии `Init`. Сокет открывает [`Self::connect`].
    ///
    /// # Параметры
    /// - `host`, `port`: адрес nsqd.
    /// - `config`: общие настройки клиента.
    /// - `extra_identify`: поля, перекрывающие `IDENTIFY` по умолчанию.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        config: Arc<NsqConfig>,
        extra_identify: Map<String, Value>,
    ) -> Self {
        let host = host.into();
        let addr = format!("{host}:{port}");
        let max_rdy = config.max_rdy_count;
        let (closed, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|me| ConnectionInner {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            host,
            port,
            addr,
            config,
            extra_identify,
            state: Mutex::new(ConnectionState::Init),
            counters: Mutex::new(RdyCounters::default()),
            busy: AtomicBool::new(false),
            disposable: AtomicBool::new(false),
            extend_support: AtomicBool::new(false),
            partition: Mutex::new(None),
            max_rdy: AtomicU64::new(max_rdy),
            negotiated: Mutex::new(None),
            delegate: RwLock::new(None),
            outbound: Mutex::new(None),
            reader: Mutex::new(None),
            timers: Timers::new(),
            closed,
            me: me.clone(),
        });
        Self { inner }
    }

    /// Устанавливает делегата. Делается до [`Self::connect`].
    pub fn set_delegate(
        &self,
        delegate: Weak<dyn ConnDelegate>,
    ) {
        *self.inner.delegate.write() = Some(delegate);
    }

    /// Открывает сокет, выполняет рукопожатие и запускает задачи чтения и
    /// записи.
    ///
    /// # Возвращает
    /// - `ConnectTimeout`, если TCP-подключение не уложилось в
    ///   `nsqd_connect_timeout`;
    /// - `ProtocolError`, если первый кадр не `OK` и не JSON.
    ///
    /// При ошибке соединение переходит в `Closed` без вызова делегата.
    pub async fn connect(&self) -> NsqResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Init {
                return Err(NsqError::protocol(format!(
                    "connect called in state {}",
                    *state
                ))
                .into());
            }
            *state = ConnectionState::Connecting;
        }

        match self.handshake().await {
            Ok(()) => {
                info!(addr = %self.inner.addr, id = self.inner.id, "connected to nsqd");
                Ok(())
            }
            Err(e) => {
                debug!(addr = %self.inner.addr, error = %e, "handshake failed");
                *self.inner.state.lock() = ConnectionState::Closed;
                self.inner.timers.cancel_all();
                self.inner.closed.send_replace(true);
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> NsqResult<()> {
        let inner = &self.inner;
        let connect_timeout = inner.config.nsqd_connect_timeout();

        let stream = match tokio::time::timeout(
            connect_timeout,
            open_socket(&inner.addr, inner.config.socket_buffer_size),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NsqError::ConnectionFailed {
                    addr: inner.addr.clone(),
                    reason: e.to_string(),
                }
                .into())
            }
            Err(_) => {
                return Err(NsqError::ConnectTimeout {
                    addr: inner.addr.clone(),
                }
                .into())
            }
        };
        stream.set_nodelay(true)?;

        inner.advance(ConnectionState::Connecting, ConnectionState::Identifying)?;

        let (read_half, mut write_half) = stream.into_split();
        let params = inner.config.identify.to_params(&inner.extra_identify)?;
        write_half.write_all(MAGIC_V2).await?;
        write_half
            .write_all(&Command::identify(&params)?.encode())
            .await?;

        let mut reader = BufReader::new(read_half);
        let limit = inner.config.packet_size_limit;
        let frame = match tokio::time::timeout(connect_timeout, read_frame(&mut reader, limit))
            .await
        {
            Ok(frame) => frame?,
            Err(_) => {
                return Err(NsqError::ConnectTimeout {
                    addr: inner.addr.clone(),
                }
                .into())
            }
        };
        self.apply_identify_response(&frame)?;

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.outbound.lock() = Some(tx);
        tokio::spawn(write_loop(inner.me.clone(), write_half, rx));
        let handle = tokio::spawn(read_loop(inner.me.clone(), reader, limit));
        *inner.reader.lock() = Some(handle);

        if let Err(e) = inner.advance(ConnectionState::Identifying, ConnectionState::Ready) {
            inner.shutdown(None);
            return Err(e);
        }
        Ok(())
    }

    fn apply_identify_response(
        &self,
        frame: &Frame,
    ) -> NsqResult<()> {
        let inner = &self.inner;
        if frame.frame_type != FrameType::Response {
            return Err(NsqError::protocol(format!(
                "unexpected identify response: {:?} {}",
                frame.frame_type,
                String::from_utf8_lossy(&frame.body)
            ))
            .into());
        }
        if frame.is_ok() {
            return Ok(());
        }
        if inner.config.identify.feature_negotiation && frame.body.first() == Some(&b'{') {
            let negotiated: IdentifyResponse = serde_json::from_slice(&frame.body)
                .map_err(|e| NsqError::protocol(format!("bad identify response: {e}")))?;
            debug!(addr = %inner.addr, ?negotiated, "identify negotiated");
            if let Some(max_rdy) = negotiated.max_rdy_count {
                inner.max_rdy.store(max_rdy, Ordering::Release);
            }
            *inner.negotiated.lock() = Some(negotiated);
            return Ok(());
        }
        Err(NsqError::protocol(format!(
            "unexpected identify response: {}",
            String::from_utf8_lossy(&frame.body)
        ))
        .into())
    }

    /// Ставит команду в очередь записи.
    ///
    /// Отказывает только закрытому или ещё не подключённому соединению:
    /// во время `WaitingClose` запись разрешена.
    pub fn write_cmd(
        &self,
        cmd: Command,
    ) -> NsqResult<()> {
        let inner = &self.inner;
        if *inner.state.lock() == ConnectionState::Closed {
            return Err(inner.closed_error());
        }
        let Some(tx) = inner.outbound.lock().clone() else {
            return Err(inner.closed_error());
        };
        if let Some(delegate) = inner.delegate() {
            delegate.on_send(self, &cmd);
        }
        tx.send(Outbound::Data(cmd.encode()))
            .map_err(|_| inner.closed_error())
    }

    /// Пытается закрыть соединение.
    ///
    /// # Параметры
    /// - `force`: закрыть сокет немедленно, без `CLS`.
    ///
    /// # Возвращает
    /// `true`, если сокет закрыт этим вызовом. При мягком закрытии с
    /// сообщениями в полёте возвращает `false` и взводит таймер
    /// `delaying_close_time`; сокет закроется, когда счётчик in-flight
    /// дойдёт до нуля или таймер сработает.
    pub fn try_close(
        &self,
        force: bool,
    ) -> bool {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            let current = *state;
            match current {
                ConnectionState::Closed => return false,
                ConnectionState::WaitingClose if !force => return false,
                ConnectionState::Ready if !force => *state = ConnectionState::WaitingClose,
                _ => {
                    drop(state);
                    inner.shutdown(None);
                    return true;
                }
            }
        }

        debug!(addr = %inner.addr, "closing gracefully");
        if let Err(e) = self.write_cmd(Command::cls()) {
            debug!(addr = %inner.addr, error = %e, "CLS not sent");
        }
        if inner.counters.lock().in_flight == 0 {
            inner.shutdown(None);
            return true;
        }

        let me = inner.me.clone();
        inner.timers.after(
            ConnTimer::DelayedClose,
            inner.config.delaying_close_time(),
            async move {
                if let Some(inner) = me.upgrade() {
                    warn!(
                        addr = %inner.addr,
                        in_flight = inner.counters.lock().in_flight,
                        "forcing close with messages in flight"
                    );
                    inner.shutdown(None);
                }
            },
        );
        false
    }

    /// Отправляет `NOP`.
    pub fn ping(&self) -> NsqResult<()> {
        self.write_cmd(Command::nop())
    }

    /// Ждёт перехода в `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Делает соединение одноразовым: оно закроется через `lifetime`
    /// независимо от использования.
    pub fn set_disposable(
        &self,
        lifetime: Duration,
    ) {
        self.inner.disposable.store(true, Ordering::Release);
        let me = self.inner.me.clone();
        self.inner.timers.after(ConnTimer::Lifetime, lifetime, async move {
            if let Some(inner) = me.upgrade() {
                debug!(addr = %inner.addr, "disposable connection expired");
                Connection { inner }.try_close(false);
            }
        });
    }

    /// Помечает соединение занятым. `false`, если оно уже занято.
    pub fn try_take(&self) -> bool {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn try_release(&self) -> bool {
        self.inner
            .busy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Выставляет остаток и последний выданный RDY.
    ///
    /// # Возвращает
    /// Остаток прежнего кредита, снятый под той же блокировкой, что и
    /// учёт входящих сообщений.
    pub fn set_rdy(
        &self,
        count: u64,
    ) -> u64 {
        self.inner.counters.lock().set_rdy(count)
    }

    pub fn set_partition(
        &self,
        partition: Option<u32>,
    ) {
        *self.inner.partition.lock() = partition;
    }

    pub fn set_extend_support(
        &self,
        extend: bool,
    ) {
        self.inner.extend_support.store(extend, Ordering::Release);
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// `host:port`.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn is_disposable(&self) -> bool {
        self.inner.disposable.load(Ordering::Acquire)
    }

    pub fn extend_support(&self) -> bool {
        self.inner.extend_support.load(Ordering::Acquire)
    }

    pub fn partition(&self) -> Option<u32> {
        *self.inner.partition.lock()
    }

    pub fn remaining_rdy(&self) -> u64 {
        self.inner.counters.lock().rdy
    }

    pub fn last_rdy(&self) -> u64 {
        self.inner.counters.lock().last_rdy
    }

    pub fn in_flight(&self) -> u64 {
        self.inner.counters.lock().in_flight
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.inner.counters.lock().last_message_at
    }

    /// Максимальный RDY: из ответа `IDENTIFY` или из настроек.
    pub fn max_rdy(&self) -> u64 {
        self.inner.max_rdy.load(Ordering::Acquire)
    }

    pub fn negotiated(&self) -> Option<IdentifyResponse> {
        self.inner.negotiated.lock().clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let counters = self.inner.counters.lock().clone();
        ConnectionSnapshot {
            id: self.inner.id,
            addr: self.inner.addr.clone(),
            state: self.state(),
            rdy: counters.rdy,
            last_rdy: counters.last_rdy,
            in_flight: counters.in_flight,
            busy: self.is_busy(),
            disposable: self.is_disposable(),
            partition: self.partition(),
        }
    }

    /// Соединение без сокета в состоянии `Ready`; записанные команды
    /// попадают в возвращаемый приёмник.
    #[cfg(test)]
    pub(crate) fn mock(
        host: &str,
        port: u16,
        config: Arc<NsqConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let conn = Self::new(host, port, config, Map::new());
        let (tx, rx) = mpsc::unbounded_channel();
        *conn.inner.outbound.lock() = Some(tx);
        *conn.inner.state.lock() = ConnectionState::Ready;
        (conn, rx)
    }

    /// Обрабатывает кадр так, будто он пришёл из сокета.
    #[cfg(test)]
    pub(crate) fn inject(
        &self,
        frame: Frame,
    ) {
        self.inner.dispatch(frame);
    }
}

impl ConnectionInner {
    fn advance(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> NsqResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(self.closed_error());
        }
        *state = to;
        Ok(())
    }

    fn handle(&self) -> Option<Connection> {
        self.me.upgrade().map(|inner| Connection { inner })
    }

    fn delegate(&self) -> Option<Arc<dyn ConnDelegate>> {
        self.delegate.read().as_ref().and_then(Weak::upgrade)
    }

    fn closed_error(&self) -> StackError {
        NsqError::ConnectionClosed {
            addr: self.addr.clone(),
        }
        .into()
    }

    /// Разбор входящего кадра в состоянии `Ready`.
    fn dispatch(
        &self,
        frame: Frame,
    ) {
        let Some(conn) = self.handle() else {
            return;
        };
        let delegate = self.delegate();
        if let Some(d) = &delegate {
            d.on_receive(&conn, &frame);
        }

        match *self.state.lock() {
            ConnectionState::Ready => {}
            state => {
                debug!(addr = %self.addr, %state, "dropping frame");
                return;
            }
        }

        if frame.is_heartbeat() {
            debug!(addr = %self.addr, "heartbeat");
            if let Some(d) = &delegate {
                d.on_heartbeat(&conn);
            }
            if let Err(e) = conn.write_cmd(Command::nop()) {
                debug!(addr = %self.addr, error = %e, "NOP not sent");
            }
            return;
        }
        if frame.is_close_wait() {
            debug!(addr = %self.addr, "received CLOSE_WAIT");
            conn.try_close(false);
            return;
        }

        match frame.frame_type {
            FrameType::Response => {
                if let Some(d) = &delegate {
                    d.on_response(&conn, frame.body);
                }
            }
            FrameType::Error => {
                let err = NsqError::server(&frame.body);
                warn!(addr = %self.addr, error = %err, "nsqd error frame");
                if let Some(d) = &delegate {
                    d.on_error(&conn, err);
                }
            }
            FrameType::Message => {
                let extended = self.extend_support.load(Ordering::Acquire);
                let msg = match Message::decode(frame.body, extended) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(addr = %self.addr, error = %e, "bad message frame");
                        self.shutdown(Some(e));
                        return;
                    }
                };
                let credited = self.counters.lock().message_received();

                let owner: Weak<dyn MsgDelegate> = self.me.clone();
                let msg = Arc::new(msg.attach(
                    owner,
                    *self.partition.lock(),
                    self.config.message_auto_response,
                ));
                if let Some(d) = &delegate {
                    d.on_message(&conn, msg, credited);
                }
            }
        }
    }

    fn on_read_error(
        &self,
        err: StackError,
    ) {
        let state = *self.state.lock();
        if state == ConnectionState::WaitingClose {
            debug!(addr = %self.addr, error = %err, "read side finished while closing");
            return;
        }
        if err.status_code() == StatusCode::UnexpectedEof {
            info!(addr = %self.addr, "nsqd closed the connection");
        } else {
            warn!(addr = %self.addr, error = %err, "read failed");
        }
        self.shutdown(Some(err));
    }

    /// Переводит соединение в `Closed`. Повторные вызовы ничего не делают.
    ///
    /// Делегат узнаёт о закрытии, только если соединение успело дойти
    /// до `Ready`.
    fn shutdown(
        &self,
        err: Option<StackError>,
    ) {
        let was_ready = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            let prev = *state;
            *state = ConnectionState::Closed;
            prev.was_ready()
        };

        self.timers.cancel_all();
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.closed.send_replace(true);
        info!(addr = %self.addr, id = self.id, "connection closed");

        if !was_ready {
            return;
        }
        if let (Some(delegate), Some(conn)) = (self.delegate(), self.handle()) {
            if let Some(err) = &err {
                delegate.on_io_error(&conn, err);
            }
            delegate.on_close(&conn);
        }
    }

    /// Закрывает соединение в `WaitingClose`, когда в полёте ничего не осталось.
    fn close_if_drained(&self) {
        let drained = *self.state.lock() == ConnectionState::WaitingClose
            && self.counters.lock().in_flight == 0;
        if drained {
            self.shutdown(None);
        }
    }

    fn requeue_delay(
        &self,
        msg: &Message,
        delay: RequeueDelay,
    ) -> Duration {
        match delay {
            RequeueDelay::Auto if self.config.message_backoff.max == 0 => Duration::ZERO,
            RequeueDelay::Auto => {
                backoff::from_config(u32::from(msg.attempts()), &self.config.message_backoff)
            }
            RequeueDelay::After(d) => d.min(self.config.max_requeue_delay()),
        }
    }
}

impl MsgDelegate for ConnectionInner {
    fn on_finish(
        &self,
        msg: &Message,
    ) {
        let Some(conn) = self.handle() else {
            return;
        };
        self.counters.lock().message_done();
        if let Some(d) = self.delegate() {
            d.on_message_finished(&conn, msg);
            d.on_resume(&conn);
        }
        if let Err(e) = conn.write_cmd(Command::fin(msg.id())) {
            debug!(addr = %self.addr, id = %msg.id(), error = %e, "FIN not sent");
        }
        self.close_if_drained();
    }

    fn on_requeue(
        &self,
        msg: &Message,
        delay: RequeueDelay,
        backoff: bool,
    ) {
        let Some(conn) = self.handle() else {
            return;
        };
        let delay = self.requeue_delay(msg, delay);
        self.counters.lock().message_done();
        if let Some(d) = self.delegate() {
            d.on_message_requeued(&conn, msg);
            if backoff {
                d.on_backoff(&conn);
            } else {
                d.on_continue(&conn);
            }
        }
        if let Err(e) = conn.write_cmd(Command::req(msg.id(), delay)) {
            debug!(addr = %self.addr, id = %msg.id(), error = %e, "REQ not sent");
        }
        self.close_if_drained();
    }

    fn on_touch(
        &self,
        msg: &Message,
    ) {
        let Some(conn) = self.handle() else {
            return;
        };
        if let Err(e) = conn.write_cmd(Command::touch(msg.id())) {
            debug!(addr = %self.addr, id = %msg.id(), error = %e, "TOUCH not sent");
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.timers.cancel_all();
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

async fn open_socket(
    addr: &str,
    buffer_size: usize,
) -> io::Result<TcpStream> {
    let size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
    let mut last_err = None;
    for sa in lookup_host(addr).await? {
        let socket = if sa.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;
        match socket.connect(sa).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{addr} resolved to nothing"))
    }))
}

async fn write_loop(
    owner: Weak<ConnectionInner>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Data(buf) => {
                if let Err(e) = writer.write_all(&buf).await {
                    if let Some(inner) = owner.upgrade() {
                        warn!(addr = %inner.addr, error = %e, "write failed");
                        inner.shutdown(Some(e.into()));
                    }
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    owner: Weak<ConnectionInner>,
    mut reader: BufReader<OwnedReadHalf>,
    limit: usize,
) {
    loop {
        let result = read_frame(&mut reader, limit).await;
        let Some(inner) = owner.upgrade() else {
            return;
        };
        match result {
            Ok(frame) => {
                inner.dispatch(frame);
                if *inner.state.lock() == ConnectionState::Closed {
                    return;
                }
            }
            Err(e) => {
                inner.on_read_error(e);
                return;
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
