//! Продюсер: публикация сообщений в один топик.
//!
//! Публикация берёт соединение из пула (или одноразовое, если свободных
//! нет), пишет команду и ждёт ответа nsqd под `publish_timeout`. На одном
//! соединении одновременно висит не больше одной публикации.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use nsqlink_error::{NsqError, NsqResult, StackError};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{
    lookup::{Lookup, LookupStats},
    lookupd::{Access, LookupdClient},
};
use crate::{
    config::NsqConfig,
    network::{
        validate_name, Command, ConnDelegate, ConnId, Connection, Message, MessageParams,
        NsqdDelegate,
    },
};

type Reply = oneshot::Sender<NsqResult<Bytes>>;

/// Продюсер топика.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

struct ProducerInner {
    topic: String,
    config: Arc<NsqConfig>,
    lookup: Lookup,
    /// Ожидающие ответа публикации по соединениям.
    pending: Mutex<HashMap<ConnId, Reply>>,
    stopped: AtomicBool,
    me: Weak<ProducerInner>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Producer {
    /// # Параметры
    /// - `topic`: проверяется сразу.
    /// - `max_conn`: желаемое число постоянных соединений.
    /// - `config`, `client`: настройки и транспорт к lookupd.
    pub fn new(
        topic: &str,
        max_conn: usize,
        config: Arc<NsqConfig>,
        client: Arc<dyn LookupdClient>,
    ) -> NsqResult<Self> {
        validate_name(topic)?;
        let lookup = Lookup::new(topic, Access::Write, max_conn, Arc::clone(&config), client)?;
        let inner = Arc::new_cyclic(|me: &Weak<ProducerInner>| {
            let conn_delegate: Weak<dyn ConnDelegate> = me.clone();
            let nsqd_delegate: Weak<dyn NsqdDelegate> = me.clone();
            lookup.set_delegates(conn_delegate, nsqd_delegate);
            ProducerInner {
                topic: topic.to_string(),
                config,
                lookup,
                pending: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                me: me.clone(),
            }
        });
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

    /// Внеочередной опрос lookupd, например после `E_BAD_TOPIC`.
    pub async fn refresh(&self) {
        self.inner.lookup.query_lookupd(None).await;
    }

    /// `PUB`. Возвращает тело ответа nsqd (`OK`).
    pub async fn publish(
        &self,
        body: impl Into<Bytes>,
    ) -> NsqResult<Bytes> {
        let body = body.into();
        let topic = &self.inner.topic;
        self.send(move |conn| Command::publish(topic, body, conn.partition()))
            .await
    }

    /// `MPUB`.
    pub async fn multi_publish(
        &self,
        bodies: Vec<Bytes>,
    ) -> NsqResult<Bytes> {
        if bodies.is_empty() {
            return Err(NsqError::EmptyMessages.into());
        }
        let topic = &self.inner.topic;
        self.send(move |_| Command::multi_publish(topic, bodies))
            .await
    }

    /// `PUB_EXT` с заголовками расширения. Если nsqd не поддерживает
    /// расширенный формат, отправляется обычный `PUB`.
    pub async fn publish_with_params(
        &self,
        body: impl Into<Bytes>,
        params: &MessageParams,
    ) -> NsqResult<Bytes> {
        let body = body.into();
        let topic = &self.inner.topic;
        self.send(move |conn| {
            if conn.extend_support() {
                Command::publish_ext(topic, body, conn.partition(), params)
            } else {
                debug!(addr = %conn.addr(), "nsqd has no extension support, sending PUB");
                Command::publish(topic, body, conn.partition())
            }
        })
        .await
    }

    async fn send<F>(
        &self,
        build: F,
    ) -> NsqResult<Bytes>
    where
        F: FnOnce(&Connection) -> NsqResult<Command>,
    {
        if self.is_stopped() {
            return Err(NsqError::Stopped.into());
        }
        let conn = self.inner.lookup.take().await?;
        let result = match build(&conn) {
            Ok(cmd) => self.inner.round_trip(&conn, cmd).await,
            Err(e) => Err(e),
        };
        self.inner.lookup.release(&conn);
        result
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.lookup.connections()
    }

    pub fn stats(&self) -> LookupStats {
        self.inner.lookup.stats()
    }

    /// Останавливает опрос lookupd и мягко закрывает соединения.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lookup.stop();
        for conn in self.inner.lookup.all_connections() {
            conn.try_close(false);
        }
        info!(topic = %self.inner.topic, "producer stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl ProducerInner {
    /// Пишет команду и ждёт ответа. По таймауту соединение закрывается
    /// принудительно: отменить отправленную публикацию нельзя.
    async fn round_trip(
        &self,
        conn: &Connection,
        cmd: Command,
    ) -> NsqResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&conn.id()) {
                return Err(NsqError::PublishInFlight {
                    addr: conn.addr().to_string(),
                }
                .into());
            }
            pending.insert(conn.id(), tx);
        }

        if let Err(e) = conn.write_cmd(cmd) {
            self.pending.lock().remove(&conn.id());
            return Err(e);
        }

        match tokio::time::timeout(self.config.publish_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NsqError::ConnectionClosed {
                addr: conn.addr().to_string(),
            }
            .into()),
            Err(_) => {
                self.pending.lock().remove(&conn.id());
                warn!(addr = %conn.addr(), topic = %self.topic, "publish timed out, closing connection");
                conn.try_close(true);
                Err(NsqError::PublishTimeout {
                    addr: conn.addr().to_string(),
                }
                .into())
            }
        }
    }

    fn resolve(
        &self,
        conn: &Connection,
        result: NsqResult<Bytes>,
    ) {
        let reply = self.pending.lock().remove(&conn.id());
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

impl NsqdDelegate for ProducerInner {
    fn on_connect(
        &self,
        conn: &Connection,
    ) {
        debug!(addr = %conn.addr(), topic = %self.topic, disposable = conn.is_disposable(), "producer connected");
    }
}

impl ConnDelegate for ProducerInner {
    fn on_response(
        &self,
        conn: &Connection,
        body: Bytes,
    ) {
        self.resolve(conn, Ok(body));
    }

    fn on_error(
        &self,
        conn: &Connection,
        err: NsqError,
    ) {
        self.resolve(conn, Err(err.into()));
    }

    fn on_message(
        &self,
        _conn: &Connection,
        _msg: Arc<Message>,
        _credited: bool,
    ) {
    }

    fn on_message_finished(
        &self,
        _conn: &Connection,
        _msg: &Message,
    ) {
    }

    fn on_message_requeued(
        &self,
        _conn: &Connection,
        _msg: &Message,
    ) {
    }

    fn on_backoff(
        &self,
        _conn: &Connection,
    ) {
    }

    fn on_continue(
        &self,
        _conn: &Connection,
    ) {
    }

    fn on_resume(
        &self,
        _conn: &Connection,
    ) {
    }

    fn on_io_error(
        &self,
        conn: &Connection,
        err: &StackError,
    ) {
        warn!(addr = %conn.addr(), error = %err, "producer connection failed");
        self.resolve(
            conn,
            Err(NsqError::Io {
                reason: err.to_string(),
            }
            .into()),
        );
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
        self.resolve(
            conn,
            Err(NsqError::ConnectionClosed {
                addr: conn.addr().to_string(),
            }
            .into()),
        );
        if conn.is_disposable() {
            return;
        }

        self.lookup.remove_connection(conn);
        info!(
            addr = %conn.addr(),
            left = self.lookup.connection_count(),
            "producer connection closed"
        );
        if self.stopped.load(Ordering::Acquire) || self.lookup.is_stopped() {
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        let conn = conn.clone();
        tokio::spawn(async move {
            inner.lookup.reconnect(&conn).await;
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use nsqlink_error::StatusCode;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::{
        client::lookupd::LookupData,
        network::{connection::Outbound, Frame, FrameType},
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

    fn producer(topic: &str) -> (Producer, Connection, UnboundedReceiver<Outbound>) {
        let config = Arc::new(NsqConfig::default());
        let producer = Producer::new(topic, 1, Arc::clone(&config), Arc::new(NoLookupd)).unwrap();
        let (conn, rx) = Connection::mock("127.0.0.1", 4150, config);
        let delegate: Weak<dyn ConnDelegate> = producer.inner.me.clone();
        conn.set_delegate(delegate);
        producer.inner.lookup.adopt(&conn);
        (producer, conn, rx)
    }

    async fn next_bytes(rx: &mut UnboundedReceiver<Outbound>) -> Bytes {
        match rx.recv().await {
            Some(Outbound::Data(bytes)) => bytes,
            other => panic!("unexpected outbound: {:?}", other.is_some()),
        }
    }

    /// Тест проверяет точный вид `PUB` для топика `t` и тела `hello`.
    #[tokio::test]
    async fn test_publish_wire_format() {
        let (producer, conn, mut rx) = producer("t");
        let task = tokio::spawn({
            let producer = producer.clone();
            async move { producer.publish("hello").await }
        });

        let wire = next_bytes(&mut rx).await;
        let mut expected = b"PUB t\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");
        assert_eq!(&wire[..], &expected[..]);

        conn.inject(Frame::new(FrameType::Response, "OK"));
        let reply = task.await.unwrap().unwrap();
        assert_eq!(&reply[..], b"OK");
        assert!(!conn.is_busy());
    }

    #[tokio::test]
    async fn test_publish_error_frame() {
        let (producer, conn, mut rx) = producer("orders");
        let task = tokio::spawn({
            let producer = producer.clone();
            async move { producer.multi_publish(vec![Bytes::from("a"), Bytes::from("b")]).await }
        });

        let wire = next_bytes(&mut rx).await;
        assert!(wire.starts_with(b"MPUB orders\n"));
        conn.inject(Frame::new(FrameType::Error, "E_BAD_TOPIC topic missing"));

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ServerError);
        assert!(!conn.is_busy());
    }

    /// Тест проверяет, что по таймауту публикации соединение закрывается
    /// принудительно, а вызов завершается `PublishTimeout`.
    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_force_closes() {
        let (producer, conn, _rx) = producer("orders");
        let err = producer.publish("x").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PublishTimeout);
        assert!(conn.is_closing());
        assert!(producer.connections().is_empty());
    }

    #[tokio::test]
    async fn test_second_publish_on_same_connection_is_rejected() {
        let (producer, conn, _rx) = producer("orders");
        let (tx, _keep) = oneshot::channel();
        producer.inner.pending.lock().insert(conn.id(), tx);

        let err = producer
            .inner
            .round_trip(&conn, Command::nop())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PublishInFlight);
    }

    #[tokio::test]
    async fn test_close_fails_pending_publish() {
        let (producer, conn, mut rx) = producer("orders");
        let task = tokio::spawn({
            let producer = producer.clone();
            async move { producer.publish("x").await }
        });
        next_bytes(&mut rx).await;

        conn.try_close(true);
        let err = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_multi_publish_rejects_empty() {
        let (producer, _conn, _rx) = producer("orders");
        let err = producer.multi_publish(Vec::new()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::EmptyMessages);
    }

    #[tokio::test]
    async fn test_stopped_producer_refuses_publish() {
        let (producer, conn, _rx) = producer("orders");
        producer.stop();
        assert!(conn.is_closing());
        let err = producer.publish("x").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::Stopped);
    }
}
