//! HTTP-клиент nsqlookupd.
//!
//! [`LookupdClient`] отделяет пул соединений от транспорта: в рабочем коде
//! используется [`HttpLookupdClient`] поверх `reqwest`, в тестах его
//! подменяют заготовленными ответами.

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use nsqlink_error::{NsqError, NsqResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Режим доступа, который lookupd учитывает при выдаче узлов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Потребители
    #[serde(rename = "r")]
    Read,
    /// Продюсеры
    #[serde(rename = "w")]
    Write,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "r",
            Access::Write => "w",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Узел nsqd из ответа lookupd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsqdNode {
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub remote_address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl NsqdNode {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupMeta {
    pub extend_support: bool,
    pub partition_num: Option<u32>,
    pub replica: Option<u32>,
}

/// Поле `data` ответа `/lookup`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupData {
    pub channels: Vec<String>,
    pub producers: Vec<NsqdNode>,
    /// Номер партиции (строкой, как в JSON) → узел-владелец.
    pub partitions: Option<BTreeMap<String, NsqdNode>>,
    pub meta: Option<LookupMeta>,
}

impl LookupData {
    pub fn extend_support(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.extend_support)
    }
}

#[derive(Debug, Deserialize)]
struct LookupEnvelope {
    status_code: Option<u16>,
    #[serde(default)]
    status_txt: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Источник ответов `/lookup`.
#[async_trait]
pub trait LookupdClient: Send + Sync {
    /// Запрашивает узлы, обслуживающие `topic`.
    ///
    /// # Параметры
    /// - `addr`: нормализованный адрес lookupd (`scheme://host:port`).
    /// - `topic`: имя топика.
    /// - `access`: `r` для потребителей, `w` для продюсеров.
    async fn lookup(
        &self,
        addr: &str,
        topic: &str,
        access: Access,
    ) -> NsqResult<LookupData>;
}

/// [`LookupdClient`] поверх `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpLookupdClient {
    client: reqwest::Client,
}

impl HttpLookupdClient {
    /// # Параметры
    /// - `timeout`: таймаут всего запроса (`nsqlookupd_connect_timeout`).
    pub fn new(timeout: Duration) -> NsqResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| NsqError::Config {
                reason: format!("http client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LookupdClient for HttpLookupdClient {
    async fn lookup(
        &self,
        addr: &str,
        topic: &str,
        access: Access,
    ) -> NsqResult<LookupData> {
        let fail = |reason: String| NsqError::Lookup {
            addr: addr.to_string(),
            reason,
        };

        let url = format!("{}/lookup", addr.trim_end_matches('/'));
        debug!(%url, topic, %access, "querying lookupd");
        let response = self
            .client
            .get(url)
            .query(&[
                ("topic", topic),
                ("metainfo", "true"),
                ("access", access.as_str()),
            ])
            .send()
            .await
            .map_err(|e| fail(format!("request: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| fail(format!("body: {e}")))?;
        parse_lookup_response(addr, status, &body)
    }
}

/// Проверяет ответ `/lookup` и достаёт из него `data`.
///
/// # Возвращает
/// `LookupFailed`, если HTTP-статус или `status_code` не 200, тело не JSON
/// или `data` пустое.
pub fn parse_lookup_response(
    addr: &str,
    http_status: u16,
    body: &[u8],
) -> NsqResult<LookupData> {
    let fail = |reason: String| -> nsqlink_error::StackError {
        NsqError::Lookup {
            addr: addr.to_string(),
            reason,
        }
        .into()
    };

    if http_status != 200 {
        return Err(fail(format!("http status {http_status}")));
    }
    let envelope: LookupEnvelope = serde_json::from_slice(body)
        .map_err(|e| fail(format!("invalid body: {e}")))?;
    if envelope.status_code != Some(200) {
        return Err(fail(format!(
            "status_code {:?} ({})",
            envelope.status_code,
            envelope.status_txt.unwrap_or_default()
        )));
    }
    let empty = match &envelope.data {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        return Err(fail("empty data".to_string()));
    }
    serde_json::from_value(envelope.data).map_err(|e| fail(format!("invalid data: {e}")))
}

/// Приводит адрес lookupd к виду `scheme://host:port` (хост в нижнем
/// регистре, порт по умолчанию берётся из схемы, иначе 80).
pub fn normalize_address(addr: &str) -> NsqResult<String> {
    let invalid = |reason: &str| -> nsqlink_error::StackError {
        NsqError::InvalidAddress {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
        .into()
    };

    let url = Url::parse(addr).map_err(|e| invalid(&e.to_string()))?;
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_lowercase(),
        _ => return Err(invalid("missing host")),
    };
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
