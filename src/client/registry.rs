//! Точка сборки клиента: реестр потребителей и продюсеров.
//!
//! [`NsqClient`] владеет всеми [`Consumer`] и [`Producer`] процесса.
//! Продюсер топика создаётся лениво при первой публикации; создание
//! сериализовано асинхронным мьютексом, чтобы параллельные первые
//! публикации не открыли два пула на один топик.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use nsqlink_error::{NsqError, NsqResult, ResultExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    consumer::Consumer,
    handler::MsgHandler,
    lookupd::{HttpLookupdClient, LookupdClient},
    producer::Producer,
};
use crate::{
    config::NsqConfig,
    network::{validate_name, MessageParams},
};

/// Шаг паузы между повторами публикации: `n`-й повтор ждёт `n * шаг`.
const PUBLISH_RETRY_STEP: Duration = Duration::from_millis(100);

/// Реестр клиентов NSQ одного приложения.
pub struct NsqClient {
    config: Arc<NsqConfig>,
    lookupd: Arc<dyn LookupdClient>,
    /// `topic:channel` → потребители
    consumers: Mutex<HashMap<String, Vec<Consumer>>>,
    producers: tokio::sync::Mutex<HashMap<String, Producer>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl NsqClient {
    /// Клиент с HTTP-транспортом к lookupd.
    pub fn new(config: NsqConfig) -> NsqResult<Self> {
        config.validate()?;
        let lookupd = HttpLookupdClient::new(config.nsqlookupd_connect_timeout())?;
        Ok(Self::with_lookupd_client(config, Arc::new(lookupd)))
    }

    /// Клиент с произвольным источником ответов lookupd.
    pub fn with_lookupd_client(
        config: NsqConfig,
        lookupd: Arc<dyn LookupdClient>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            lookupd,
            consumers: Mutex::new(HashMap::new()),
            producers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &NsqConfig {
        &self.config
    }

    fn lookupd_addrs(&self) -> NsqResult<&[String]> {
        if self.config.lookupd_addrs.is_empty() {
            return Err(NsqError::NoLookupd.into());
        }
        Ok(&self.config.lookupd_addrs)
    }

    /// Подписывает обработчик на `topic/channel`.
    ///
    /// # Параметры
    /// - `handler`: обработчик сообщений.
    /// - `max_in_flight`: бюджет RDY, по умолчанию из настроек.
    ///
    /// # Возвращает
    /// Запущенного потребителя. Он же хранится в реестре до
    /// [`Self::unsubscribe`].
    pub async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MsgHandler>,
        max_in_flight: Option<u64>,
    ) -> NsqResult<Consumer> {
        validate_name(topic)?;
        validate_name(channel)?;
        let addrs = self.lookupd_addrs()?;

        let max_in_flight = max_in_flight
            .filter(|n| *n > 0)
            .unwrap_or(self.config.max_in_flight);
        let consumer = Consumer::new(
            topic,
            channel,
            handler,
            max_in_flight,
            Arc::clone(&self.config),
            Arc::clone(&self.lookupd),
        )?;
        if let Err(e) = consumer.connect_to_lookupds(addrs).await {
            consumer.stop();
            return Err(e.context(format!("subscribe {topic}/{channel}")));
        }

        self.consumers
            .lock()
            .entry(format!("{topic}:{channel}"))
            .or_default()
            .push(consumer.clone());
        info!(topic, channel, max_in_flight, "subscribed");
        Ok(consumer)
    }

    /// Останавливает всех потребителей `topic/channel`.
    ///
    /// # Возвращает
    /// `false`, если подписок не было.
    pub fn unsubscribe(
        &self,
        topic: &str,
        channel: &str,
    ) -> bool {
        let removed = self.consumers.lock().remove(&format!("{topic}:{channel}"));
        match removed {
            Some(consumers) if !consumers.is_empty() => {
                for consumer in &consumers {
                    consumer.stop();
                }
                info!(topic, channel, count = consumers.len(), "unsubscribed");
                true
            }
            _ => false,
        }
    }

    pub fn consumers(
        &self,
        topic: &str,
        channel: &str,
    ) -> Vec<Consumer> {
        self.consumers
            .lock()
            .get(&format!("{topic}:{channel}"))
            .cloned()
            .unwrap_or_default()
    }

    /// Публикует сообщения: одно уходит как `PUB`, несколько как `MPUB`.
    pub async fn publish(
        &self,
        topic: &str,
        messages: Vec<Bytes>,
    ) -> NsqResult<Bytes> {
        validate_name(topic)?;
        self.lookupd_addrs()?;
        if messages.is_empty() {
            return Err(NsqError::EmptyMessages.into());
        }

        let producer = self.producer(topic).await?;
        let count = messages.len();
        self.with_retry(&producer, count, || {
            let producer = producer.clone();
            let messages = messages.clone();
            async move {
                match <[Bytes; 1]>::try_from(messages) {
                    Ok([body]) => producer.publish(body).await,
                    Err(messages) => producer.multi_publish(messages).await,
                }
            }
        })
        .await
    }

    /// Публикует значения, сериализованные в JSON.
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        messages: &[T],
    ) -> NsqResult<Bytes> {
        let bodies = messages
            .iter()
            .map(|m| serde_json::to_vec(m).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()
            .context("encode message")?;
        self.publish(topic, bodies).await
    }

    /// `PUB_EXT` с заголовками расширения.
    pub async fn publish_with_params(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        params: &MessageParams,
    ) -> NsqResult<Bytes> {
        validate_name(topic)?;
        self.lookupd_addrs()?;
        let body = body.into();

        let producer = self.producer(topic).await?;
        self.with_retry(&producer, 1, || {
            let producer = producer.clone();
            let body = body.clone();
            let params = params.clone();
            async move { producer.publish_with_params(body, &params).await }
        })
        .await
    }

    /// Повторяет публикацию до `publish_retry` раз. На `E_BAD_TOPIC`
    /// перед повтором заново опрашивает lookupd.
    async fn with_retry<F, Fut>(
        &self,
        producer: &Producer,
        count: usize,
        mut attempt: F,
    ) -> NsqResult<Bytes>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = NsqResult<Bytes>>,
    {
        let retries = self.config.publish_retry;
        let mut n = 0;
        loop {
            let err = match attempt().await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            let bad_topic = err.is_bad_topic();
            if n >= retries {
                warn!(
                    topic = %producer.topic(),
                    count,
                    nsqd = err.addr().unwrap_or("-"),
                    error = %err,
                    "publish failed"
                );
                return Err(err.context(format!(
                    "publish {count} message(s) to topic {} failed after {} attempt(s)",
                    producer.topic(),
                    n + 1
                )));
            }

            n += 1;
            debug!(topic = %producer.topic(), attempt = n, error = %err, "retrying publish");
            if bad_topic {
                producer.refresh().await;
            }
            tokio::time::sleep(PUBLISH_RETRY_STEP * n).await;
        }
    }

    /// Создаёт продюсеров заранее, например для `topics` из настроек.
    pub async fn prepare_producers<S: AsRef<str>>(
        &self,
        topics: &[S],
    ) -> NsqResult<()> {
        let addrs = self.lookupd_addrs()?;
        let mut producers = self.producers.lock().await;
        for topic in topics {
            let topic = topic.as_ref();
            validate_name(topic)?;
            if producers.contains_key(topic) {
                continue;
            }
            let producer = self.new_producer(topic, addrs).await?;
            producers.insert(topic.to_string(), producer);
        }
        Ok(())
    }

    async fn producer(
        &self,
        topic: &str,
    ) -> NsqResult<Producer> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(topic) {
            return Ok(producer.clone());
        }
        let producer = self.new_producer(topic, self.lookupd_addrs()?).await?;
        producers.insert(topic.to_string(), producer.clone());
        Ok(producer)
    }

    async fn new_producer(
        &self,
        topic: &str,
        addrs: &[String],
    ) -> NsqResult<Producer> {
        let producer = Producer::new(
            topic,
            self.config.max_connection_per_topic,
            Arc::clone(&self.config),
            Arc::clone(&self.lookupd),
        )?;
        if let Err(e) = producer.connect_to_lookupds(addrs).await {
            producer.stop();
            return Err(e.context(format!("prepare producer for {topic}")));
        }
        info!(topic, "producer ready");
        Ok(producer)
    }

    /// Останавливает всех потребителей и продюсеров.
    pub async fn stop(&self) {
        let consumers: Vec<Consumer> = self
            .consumers
            .lock()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for consumer in consumers {
            consumer.stop();
        }
        for (_, producer) in self.producers.lock().await.drain() {
            producer.stop();
        }
        info!("nsq client stopped");
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use nsqlink_error::StatusCode;

    use super::*;
    use crate::client::{
        handler::FnHandler,
        lookupd::{Access, LookupData},
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

    fn client(lookupd_addrs: &[&str]) -> NsqClient {
        let config = NsqConfig {
            lookupd_addrs: lookupd_addrs.iter().map(|s| s.to_string()).collect(),
            lookupd_retries: 1,
            ..NsqConfig::default()
        };
        NsqClient::with_lookupd_client(config, Arc::new(NoLookupd))
    }

    fn handler() -> Arc<dyn MsgHandler> {
        Arc::new(FnHandler::new(|_msg| async { Ok::<_, anyhow::Error>(true) }))
    }

    #[tokio::test]
    async fn test_publish_without_lookupd() {
        let client = client(&[]);
        let err = client
            .publish("orders", vec![Bytes::from("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotConnected);
        assert!(matches!(err.nsq(), Some(NsqError::NoLookupd)));
    }

    #[tokio::test]
    async fn test_publish_validates_before_io() {
        let client = client(&["http://127.0.0.1:4161"]);
        let err = client
            .publish("bad topic", vec![Bytes::from("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidName);

        let err = client.publish("orders", Vec::new()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::EmptyMessages);
    }

    /// Тест проверяет, что без известных nsqd публикация исчерпывает
    /// повторы и возвращает ошибку с контекстом топика.
    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_then_fails_with_context() {
        let client = client(&["http://127.0.0.1:4161"]);
        let err = client
            .publish("orders", vec![Bytes::from("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NotConnected);
        assert!(err
            .contexts()
            .iter()
            .any(|c| c.message.contains("topic orders")));
        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_and_unsubscribe() {
        let client = client(&["http://127.0.0.1:4161"]);
        let consumer = client
            .subscribe("orders", "billing", handler(), Some(10))
            .await
            .unwrap();
        assert_eq!(consumer.max_in_flight(), 10);
        assert_eq!(client.consumers("orders", "billing").len(), 1);

        assert!(client.unsubscribe("orders", "billing"));
        assert!(consumer.is_stopped());
        assert!(!client.unsubscribe("orders", "billing"));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_names() {
        let client = client(&["http://127.0.0.1:4161"]);
        let err = client
            .subscribe("orders", "", handler(), None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.status_code(), StatusCode::InvalidName);
        assert!(client.consumers("orders", "").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_producers_is_idempotent() {
        let client = client(&["http://127.0.0.1:4161"]);
        client.prepare_producers(&["orders", "events"]).await.unwrap();
        client.prepare_producers(&["orders"]).await.unwrap();
        assert_eq!(client.producers.lock().await.len(), 2);
        client.stop().await;
        assert!(client.producers.lock().await.is_empty());
    }
}
