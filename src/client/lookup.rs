//! Обнаружение nsqd через lookupd и пул соединений одного топика.
//!
//! Каждое соединение в учёте пула находится ровно в одном из множеств
//! `pending` (рукопожатие), `idle` (свободно) или `busy` (выдано).
//! Блокировка пула никогда не удерживается через `.await` и во время
//! вызова делегатов.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use nsqlink_error::{NsqError, NsqResult};
use parking_lot::{Mutex, RwLock};
use rand::{seq::IteratorRandom, seq::SliceRandom, Rng};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::lookupd::{normalize_address, Access, LookupData, LookupdClient};
use crate::{
    config::NsqConfig,
    network::{validate_name, ConnDelegate, ConnId, Connection, NsqdDelegate},
    timer::Timers,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LookupTimer {
    PollStart,
    Poll,
    /// Отложенное переподключение к `host:port`
    Reconnect(String),
}

/// Известный адрес nsqd и число открытых (или открывающихся) соединений.
#[derive(Debug, Clone)]
struct NsqdSlot {
    host: String,
    port: u16,
    conns: usize,
}

#[derive(Default)]
struct PoolState {
    /// Адреса lookupd в порядке регистрации.
    lookupd_addrs: Vec<String>,
    /// Узлы, которые вернул каждый lookupd при последнем опросе.
    discovered: HashMap<String, Vec<String>>,
    query_index: usize,
    nsqd: BTreeMap<String, NsqdSlot>,
    node_partitions: HashMap<String, Vec<u32>>,
    pending: HashMap<ConnId, Connection>,
    idle: HashMap<ConnId, Connection>,
    busy: HashMap<ConnId, Connection>,
    max_conn: usize,
    extend_support: bool,
}

impl PoolState {
    /// `ceil(max_conn / число адресов)`, `0` без адресов.
    fn per_nsqd_max(&self) -> usize {
        let n = self.nsqd.len();
        if n == 0 {
            return 0;
        }
        self.max_conn.div_ceil(n)
    }

    fn next_lookupd_endpoint(&mut self) -> Option<String> {
        let n = self.lookupd_addrs.len();
        if n == 0 {
            return None;
        }
        if self.query_index >= n {
            self.query_index = 0;
        }
        let addr = self.lookupd_addrs[self.query_index].clone();
        self.query_index = (self.query_index + 1) % n;
        Some(addr)
    }

    fn remove(
        &mut self,
        conn: &Connection,
    ) -> bool {
        let id = conn.id();
        let removed = self.pending.remove(&id).is_some()
            | self.idle.remove(&id).is_some()
            | self.busy.remove(&id).is_some();
        if removed {
            if let Some(slot) = self.nsqd.get_mut(conn.addr()) {
                slot.conns = slot.conns.saturating_sub(1);
            }
        }
        removed
    }
}

/// Статистика пула.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupStats {
    /// Свободные и выданные соединения
    pub nsqd_connections: usize,
    /// Адрес lookupd → (адрес nsqd → число соединений)
    pub lookupd: BTreeMap<String, BTreeMap<String, usize>>,
}

/// Пул соединений к nsqd одного топика.
#[derive(Clone)]
pub struct Lookup {
    inner: Arc<LookupInner>,
}

struct LookupInner {
    topic: String,
    access: Access,
    config: Arc<NsqConfig>,
    client: Arc<dyn LookupdClient>,
    extra_identify: RwLock<Map<String, Value>>,
    state: Mutex<PoolState>,
    stopped: AtomicBool,
    conn_delegate: RwLock<Option<Weak<dyn ConnDelegate>>>,
    nsqd_delegate: RwLock<Option<Weak<dyn NsqdDelegate>>>,
    timers: Timers<LookupTimer>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Lookup {
    /// # Параметры
    /// - `topic`: имя топика, проверяется сразу.
    /// - `access`: режим доступа для запросов к lookupd.
    /// - `max_conn`: желаемое общее число соединений.
    /// - `config`, `client`: настройки и транспорт к lookupd.
    pub fn new(
        topic: &str,
        access: Access,
        max_conn: usize,
        config: Arc<NsqConfig>,
        client: Arc<dyn LookupdClient>,
    ) -> NsqResult<Self> {
        validate_name(topic)?;
        let state = PoolState {
            max_conn,
            ..PoolState::default()
        };
        Ok(Self {
            inner: Arc::new(LookupInner {
                topic: topic.to_string(),
                access,
                config,
                client,
                extra_identify: RwLock::new(Map::new()),
                state: Mutex::new(state),
                stopped: AtomicBool::new(false),
                conn_delegate: RwLock::new(None),
                nsqd_delegate: RwLock::new(None),
                timers: Timers::new(),
            }),
        })
    }

    /// Делегаты, которые получат новые соединения.
    pub fn set_delegates(
        &self,
        conn: Weak<dyn ConnDelegate>,
        nsqd: Weak<dyn NsqdDelegate>,
    ) {
        *self.inner.conn_delegate.write() = Some(conn);
        *self.inner.nsqd_delegate.write() = Some(nsqd);
    }

    /// Дополнительные поля `IDENTIFY` для соединений на чтение.
    pub fn set_extra_identify(
        &self,
        params: Map<String, Value>,
    ) {
        *self.inner.extra_identify.write() = params;
    }

    /// Регистрирует адрес lookupd. Первый зарегистрированный адрес
    /// сразу опрашивается и запускает периодический опрос.
    pub async fn connect_to_lookupd(
        &self,
        addr: &str,
    ) -> NsqResult<()> {
        self.ensure_running()?;
        let addr = normalize_address(addr)?;
        let first = {
            let mut state = self.inner.state.lock();
            if state.lookupd_addrs.contains(&addr) {
                return Ok(());
            }
            state.lookupd_addrs.push(addr.clone());
            state.lookupd_addrs.len() == 1
        };
        info!(topic = %self.inner.topic, lookupd = %addr, "lookupd registered");

        self.query_lookupd(Some(&addr)).await;
        if first {
            self.start_polling();
        }
        Ok(())
    }

    /// Удаляет адрес lookupd и закрывает соединения к узлам, которые
    /// больше не известны ни одному оставшемуся lookupd.
    pub fn disconnect_from_lookupd(
        &self,
        addr: &str,
    ) -> NsqResult<()> {
        let addr = normalize_address(addr)?;
        let to_close: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            let Some(pos) = state.lookupd_addrs.iter().position(|a| *a == addr) else {
                return Err(NsqError::InvalidAddress {
                    addr,
                    reason: "lookupd is not registered".to_string(),
                }
                .into());
            };
            if state.lookupd_addrs.len() == 1 {
                return Err(NsqError::InvalidAddress {
                    addr,
                    reason: "cannot disconnect from the only remaining lookupd".to_string(),
                }
                .into());
            }
            state.lookupd_addrs.remove(pos);
            let orphaned = state.discovered.remove(&addr).unwrap_or_default();
            let still_known =
                |node: &String| state.discovered.values().any(|nodes| nodes.contains(node));
            let orphaned: Vec<String> = orphaned.into_iter().filter(|n| !still_known(n)).collect();
            all_connections(&state)
                .into_iter()
                .filter(|c| orphaned.iter().any(|n| n == c.addr()))
                .collect()
        };

        info!(topic = %self.inner.topic, lookupd = %addr, closing = to_close.len(), "lookupd removed");
        for conn in to_close {
            conn.try_close(false);
        }
        Ok(())
    }

    /// Опрашивает lookupd (следующий по кругу, если `addr` не задан) и
    /// подключается к новым узлам. Ошибки только логируются.
    pub async fn query_lookupd(
        &self,
        addr: Option<&str>,
    ) {
        let addr = match addr {
            Some(addr) => addr.to_string(),
            None => match self.next_lookupd_endpoint() {
                Some(addr) => addr,
                None => return,
            },
        };
        let Some(data) = self.lookup_with_retry(&addr).await else {
            return;
        };
        let nodes = self.register_nodes(&addr, &data);
        self.connect_to_nsqd_list(nodes).await;
    }

    /// Следующий адрес lookupd по кругу.
    pub fn next_lookupd_endpoint(&self) -> Option<String> {
        self.inner.state.lock().next_lookupd_endpoint()
    }

    async fn lookup_with_retry(
        &self,
        addr: &str,
    ) -> Option<LookupData> {
        let retries = self.inner.config.lookupd_retries.max(1);
        for attempt in 1..=retries {
            match self
                .inner
                .client
                .lookup(addr, &self.inner.topic, self.inner.access)
                .await
            {
                Ok(data) => return Some(data),
                Err(e) => {
                    warn!(
                        topic = %self.inner.topic,
                        lookupd = %addr,
                        attempt,
                        error = %e,
                        "lookupd query failed"
                    );
                    if attempt < retries {
                        tokio::time::sleep(self.inner.config.lookupd_retry_sleep()).await;
                    }
                }
            }
        }
        None
    }

    /// Запоминает узлы из ответа lookupd и возвращает их `(host, port)`.
    fn register_nodes(
        &self,
        lookupd: &str,
        data: &LookupData,
    ) -> Vec<(String, u16)> {
        let mut nodes: BTreeMap<String, (String, u16)> = BTreeMap::new();
        for producer in &data.producers {
            nodes.insert(
                producer.addr(),
                (producer.broadcast_address.clone(), producer.tcp_port),
            );
        }

        let mut node_partitions: HashMap<String, Vec<u32>> = HashMap::new();
        if let Some(partitions) = &data.partitions {
            for (partition, producer) in partitions {
                let key = producer.addr();
                nodes.insert(
                    key.clone(),
                    (producer.broadcast_address.clone(), producer.tcp_port),
                );
                match partition.parse::<u32>() {
                    Ok(id) => node_partitions.entry(key).or_default().push(id),
                    Err(_) => debug!(%partition, "ignoring non-numeric partition"),
                }
            }
        }

        let mut state = self.inner.state.lock();
        if data.extend_support() {
            state.extend_support = true;
        }
        for (key, (host, port)) in &nodes {
            state.nsqd.entry(key.clone()).or_insert_with(|| NsqdSlot {
                host: host.clone(),
                port: *port,
                conns: 0,
            });
        }
        if data.partitions.is_some() {
            state.node_partitions = node_partitions;
        }
        state.max_conn = state.max_conn.max(nodes.len());
        state
            .discovered
            .insert(lookupd.to_string(), nodes.keys().cloned().collect());
        nodes.into_values().collect()
    }

    async fn connect_to_nsqd_list(
        &self,
        nodes: Vec<(String, u16)>,
    ) {
        for (host, port) in nodes {
            if let Err(e) = self.connect_to_nsqd(&host, port).await {
                warn!(
                    topic = %self.inner.topic,
                    addr = %format!("{host}:{port}"),
                    error = %e,
                    "error connecting to nsqd"
                );
            }
        }
    }

    /// Открывает недостающие соединения к адресу nsqd.
    ///
    /// Каждое новое соединение сначала учитывается как `pending`, после
    /// рукопожатия переходит в `idle` и передаётся [`NsqdDelegate`]. При
    /// ошибке счётчик адреса откатывается, а ошибка возвращается.
    pub async fn connect_to_nsqd(
        &self,
        host: &str,
        port: u16,
    ) -> NsqResult<Vec<Connection>> {
        self.ensure_running()?;
        let key = format!("{host}:{port}");
        let remain = {
            let mut state = self.inner.state.lock();
            let conns = state
                .nsqd
                .entry(key.clone())
                .or_insert_with(|| NsqdSlot {
                    host: host.to_string(),
                    port,
                    conns: 0,
                })
                .conns;
            state.per_nsqd_max().saturating_sub(conns)
        };

        let mut conns = Vec::with_capacity(remain);
        for _ in 0..remain {
            let conn = self.new_pending(host, port, &key);
            let result = conn.connect().await;
            {
                let mut state = self.inner.state.lock();
                state.pending.remove(&conn.id());
                if let Err(e) = result {
                    if let Some(slot) = state.nsqd.get_mut(&key) {
                        slot.conns = slot.conns.saturating_sub(1);
                    }
                    return Err(e);
                }
                state.idle.insert(conn.id(), conn.clone());
            }
            self.notify_connect(&conn);
            conns.push(conn);
        }
        Ok(conns)
    }

    fn new_pending(
        &self,
        host: &str,
        port: u16,
        key: &str,
    ) -> Connection {
        let extra = match self.inner.access {
            Access::Read => self.inner.extra_identify.read().clone(),
            Access::Write => Map::new(),
        };
        let conn = Connection::new(host, port, Arc::clone(&self.inner.config), extra);
        if let Some(delegate) = self.inner.conn_delegate.read().clone() {
            conn.set_delegate(delegate);
        }

        let mut state = self.inner.state.lock();
        if let Some(slot) = state.nsqd.get_mut(key) {
            slot.conns += 1;
        }
        let partition = state
            .node_partitions
            .get(key)
            .and_then(|parts| parts.choose(&mut rand::thread_rng()).copied());
        conn.set_partition(partition);
        conn.set_extend_support(state.extend_support);
        state.pending.insert(conn.id(), conn.clone());
        conn
    }

    fn notify_connect(
        &self,
        conn: &Connection,
    ) {
        let delegate = self.inner.nsqd_delegate.read().as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            delegate.on_connect(conn);
        }
    }

    /// Закрывает все соединения к адресу nsqd и обнуляет его счётчик.
    pub fn disconnect_from_nsqd(
        &self,
        host: &str,
        port: u16,
    ) -> NsqResult<()> {
        let key = format!("{host}:{port}");
        let to_close: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.nsqd.get_mut(&key) else {
                return Err(NsqError::InvalidAddress {
                    addr: key,
                    reason: "nsqd is not connected".to_string(),
                }
                .into());
            };
            slot.conns = 0;
            all_connections(&state)
                .into_iter()
                .filter(|c| c.addr() == key)
                .collect()
        };
        for conn in to_close {
            conn.try_close(false);
        }
        Ok(())
    }

    /// Выдаёт свободное соединение, помеченное занятым. Если свободных нет,
    /// открывает одноразовое соединение к случайному известному nsqd.
    ///
    /// # Возвращает
    /// `NotConnected`, если ни один адрес nsqd ещё не известен.
    pub async fn take(&self) -> NsqResult<Connection> {
        self.ensure_running()?;
        let (host, port) = {
            let mut state = self.inner.state.lock();
            let mut rng = rand::thread_rng();
            if state.nsqd.is_empty() {
                return Err(NsqError::NotConnected {
                    topic: self.inner.topic.clone(),
                }
                .into());
            }
            let idle = state.idle.keys().copied().choose(&mut rng);
            if let Some(id) = idle {
                if let Some(conn) = state.idle.get(&id).cloned() {
                    if conn.try_take() {
                        state.idle.remove(&id);
                        state.busy.insert(id, conn.clone());
                        return Ok(conn);
                    }
                }
            }
            match state.nsqd.values().choose(&mut rng) {
                Some(slot) => (slot.host.clone(), slot.port),
                None => {
                    return Err(NsqError::NotConnected {
                        topic: self.inner.topic.clone(),
                    }
                    .into())
                }
            }
        };

        debug!(topic = %self.inner.topic, addr = %format!("{host}:{port}"), "opening disposable connection");
        let conn = Connection::new(&host, port, Arc::clone(&self.inner.config), Map::new());
        conn.set_extend_support(self.inner.state.lock().extend_support);
        if let Some(delegate) = self.inner.conn_delegate.read().clone() {
            conn.set_delegate(delegate);
        }
        conn.connect().await?;
        conn.set_disposable(self.inner.config.disposable_connection_lifecycle());
        conn.try_take();
        self.notify_connect(&conn);
        Ok(conn)
    }

    /// Возвращает постоянное соединение в `idle`.
    pub fn release(
        &self,
        conn: &Connection,
    ) -> bool {
        if !conn.try_release() || conn.is_disposable() {
            return false;
        }
        let mut state = self.inner.state.lock();
        match state.busy.remove(&conn.id()) {
            Some(conn) => {
                state.idle.insert(conn.id(), conn);
                true
            }
            None => false,
        }
    }

    /// Решает, как восстановить потерянное соединение.
    ///
    /// Одноразовые не восстанавливаются. При наличии lookupd выполняется
    /// внеочередной опрос. Без lookupd, если адрес ещё известен,
    /// переподключение откладывается на `reconnect_delay`.
    ///
    /// # Возвращает
    /// `true`, если был выполнен опрос lookupd.
    pub async fn reconnect(
        &self,
        conn: &Connection,
    ) -> bool {
        if conn.is_disposable() || self.is_stopped() {
            return false;
        }
        let (has_lookupd, tracked) = {
            let state = self.inner.state.lock();
            (
                !state.lookupd_addrs.is_empty(),
                state.nsqd.contains_key(conn.addr()),
            )
        };
        if has_lookupd {
            self.query_lookupd(None).await;
            return true;
        }
        if tracked {
            self.delay_reconnect(conn.host().to_string(), conn.port());
        }
        false
    }

    fn delay_reconnect(
        &self,
        host: String,
        port: u16,
    ) {
        let key = format!("{host}:{port}");
        let weak = Arc::downgrade(&self.inner);
        debug!(topic = %self.inner.topic, addr = %key, "scheduling reconnect");
        self.inner.timers.after(
            LookupTimer::Reconnect(key.clone()),
            self.inner.config.reconnect_delay(),
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let lookup = Lookup { inner };
                if lookup.is_stopped() || !lookup.inner.state.lock().nsqd.contains_key(&key) {
                    return;
                }
                if let Err(e) = lookup.connect_to_nsqd(&host, port).await {
                    warn!(addr = %key, error = %e, "reconnect failed");
                    lookup.delay_reconnect(host, port);
                }
            },
        );
    }

    /// Убирает соединение из всех множеств пула. Повторный вызов ничего
    /// не меняет.
    pub fn remove_connection(
        &self,
        conn: &Connection,
    ) -> bool {
        self.inner.state.lock().remove(conn)
    }

    fn start_polling(&self) {
        let interval = self.inner.config.lookupd_poll_interval();
        let jitter = rand::thread_rng().gen_range(0.0..1.0)
            * self.inner.config.lookupd_poll_jitter
            * interval.as_secs_f64();
        let delay = Duration::from_secs_f64(jitter) + Duration::from_millis(1);

        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.after(LookupTimer::PollStart, delay, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.stopped.load(Ordering::Acquire) {
                return;
            }
            let weak = Arc::downgrade(&inner);
            inner.timers.tick(LookupTimer::Poll, interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Lookup { inner }.query_lookupd(None).await;
                    }
                }
            });
        });
    }

    /// Останавливает опрос lookupd. Соединения закрывает владелец.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.timers.cancel_all();
        info!(topic = %self.inner.topic, "lookup stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> NsqResult<()> {
        if self.is_stopped() {
            return Err(NsqError::Stopped.into());
        }
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn access(&self) -> Access {
        self.inner.access
    }

    /// Свободные и выданные соединения.
    pub fn connections(&self) -> Vec<Connection> {
        let state = self.inner.state.lock();
        state
            .idle
            .values()
            .chain(state.busy.values())
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.idle.len() + state.busy.len()
    }

    /// Все соединения пула, включая открывающиеся.
    pub fn all_connections(&self) -> Vec<Connection> {
        all_connections(&self.inner.state.lock())
    }

    pub fn lookupd_addrs(&self) -> Vec<String> {
        self.inner.state.lock().lookupd_addrs.clone()
    }

    /// Адрес nsqd → число соединений.
    pub fn nsqd_conn_counts(&self) -> BTreeMap<String, usize> {
        self.inner
            .state
            .lock()
            .nsqd
            .iter()
            .map(|(k, slot)| (k.clone(), slot.conns))
            .collect()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.state.lock().max_conn
    }

    pub fn stats(&self) -> LookupStats {
        let state = self.inner.state.lock();
        let lookupd = state
            .lookupd_addrs
            .iter()
            .map(|addr| {
                let nodes: BTreeMap<String, usize> = state
                    .discovered
                    .get(addr)
                    .map(|nodes| {
                        nodes
                            .iter()
                            .map(|n| (n.clone(), state.nsqd.get(n).map_or(0, |s| s.conns)))
                            .collect()
                    })
                    .unwrap_or_default();
                (addr.clone(), nodes)
            })
            .collect();
        LookupStats {
            nsqd_connections: state.idle.len() + state.busy.len(),
            lookupd,
        }
    }

    /// Кладёт готовое соединение в `idle`, минуя рукопожатие.
    #[cfg(test)]
    pub(crate) fn adopt(
        &self,
        conn: &Connection,
    ) {
        let mut state = self.inner.state.lock();
        state
            .nsqd
            .entry(conn.addr().to_string())
            .or_insert_with(|| NsqdSlot {
                host: conn.host().to_string(),
                port: conn.port(),
                conns: 0,
            })
            .conns += 1;
        state.idle.insert(conn.id(), conn.clone());
    }
}

fn all_connections(state: &PoolState) -> Vec<Connection> {
    state
        .pending
        .values()
        .chain(state.idle.values())
        .chain(state.busy.values())
        .cloned()
        .collect()
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
