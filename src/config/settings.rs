use std::time::Duration;

use config::{Config, Environment, File};
use nsqlink_error::{NsqError, NsqResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Переменная окружения с путём к файлу настроек.
pub const CONFIG_PATH_ENV: &str = "NSQLINK_CONFIG";

const USER_AGENT: &str = concat!("nsqlink/", env!("CARGO_PKG_VERSION"));

/// Параметры, которые клиент отправляет в `IDENTIFY`.
///
/// Значения по умолчанию совпадают с тем, что ожидает nsqd от типичного
/// потребителя; ответ nsqd хранится отдельно в каждом соединении.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyConfig {
    pub client_id: String,
    pub hostname: String,
    pub feature_negotiation: bool,
    /// Интервал heartbeat в миллисекундах.
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    /// `-1` отключает буферизацию на стороне nsqd.
    pub output_buffer_timeout: i64,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub sample_rate: i32,
    pub user_agent: String,
    /// Таймаут сообщения на стороне nsqd, мс.
    pub msg_timeout: u64,
}

/// Параметры экспоненциального backoff (миллисекунды).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min: u64,
    /// `0` означает немедленный повтор при `REQ` без явной задержки.
    pub max: u64,
    pub factor: f64,
    /// Доля случайного разброса, `[0, 1]`.
    pub jitter: f64,
}

/// Настройки клиента NSQ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NsqConfig {
    /// HTTP-адреса nsqlookupd.
    pub lookupd_addrs: Vec<String>,
    /// Топики, для которых продюсеры создаются при старте.
    pub topics: Vec<String>,
    pub identify: IdentifyConfig,
    pub message_backoff: BackoffConfig,
    pub max_backoff_duration: u64,
    pub max_requeue_delay: u64,
    pub max_in_flight: u64,
    /// Максимальный RDY, пока nsqd не сообщил свой `max_rdy_count`.
    pub max_rdy_count: u64,
    /// `0` отключает ограничение на число попыток.
    pub max_attempts: u16,
    pub enable_backoff: bool,
    pub message_auto_response: bool,
    pub nsqd_connect_timeout: u64,
    pub nsqlookupd_connect_timeout: u64,
    pub lookupd_poll_interval: u64,
    pub lookupd_poll_jitter: f64,
    pub lookupd_retries: u32,
    pub lookupd_retry_sleep: u64,
    pub delaying_close_time: u64,
    pub rdy_redistribute_interval: u64,
    pub rdy_retry_delay: u64,
    /// Пауза перед повторным подключением к nsqd без lookupd.
    pub reconnect_delay: u64,
    pub low_rdy_idle_timeout: u64,
    pub publish_timeout: u64,
    pub publish_retry: u32,
    pub disposable_connection_lifecycle: u64,
    pub max_connection_per_topic: usize,
    pub socket_buffer_size: usize,
    pub packet_size_limit: usize,
}

////////////////////////////////////////////////////////////////////////////////
// Значения по умолчанию
////////////////////////////////////////////////////////////////////////////////

impl Default for IdentifyConfig {
    fn default() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            client_id: host.clone(),
            hostname: host,
            feature_negotiation: true,
            heartbeat_interval: 30_000,
            output_buffer_size: 16_384,
            output_buffer_timeout: -1,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 1,
            sample_rate: 0,
            user_agent: USER_AGENT.to_string(),
            msg_timeout: 60_000,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: 2_000,
            max: 600_000,
            factor: 2.0,
            jitter: 0.3,
        }
    }
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            lookupd_addrs: Vec::new(),
            topics: Vec::new(),
            identify: IdentifyConfig::default(),
            message_backoff: BackoffConfig::default(),
            max_backoff_duration: 60_000,
            max_requeue_delay: 3_600_000,
            max_in_flight: 2_500,
            max_rdy_count: 2_500,
            max_attempts: 5,
            enable_backoff: true,
            message_auto_response: true,
            nsqd_connect_timeout: 3_000,
            nsqlookupd_connect_timeout: 3_000,
            lookupd_poll_interval: 60_000,
            lookupd_poll_jitter: 0.3,
            lookupd_retries: 3,
            lookupd_retry_sleep: 500,
            delaying_close_time: 5_000,
            rdy_redistribute_interval: 5_000,
            rdy_retry_delay: 5_000,
            reconnect_delay: 5_000,
            low_rdy_idle_timeout: 10_000,
            publish_timeout: 3_000,
            publish_retry: 3,
            disposable_connection_lifecycle: 3_000,
            max_connection_per_topic: 1,
            socket_buffer_size: 327_679,
            packet_size_limit: 327_679,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl IdentifyConfig {
    /// JSON-объект для `IDENTIFY`, дополненный (и перекрытый) `overrides`.
    pub fn to_params(
        &self,
        overrides: &Map<String, Value>,
    ) -> NsqResult<Map<String, Value>> {
        let mut params = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                return Err(NsqError::Config {
                    reason: format!("identify params: {e}"),
                }
                .into())
            }
        };
        for (k, v) in overrides {
            params.insert(k.clone(), v.clone());
        }
        Ok(params)
    }
}

impl BackoffConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max)
    }
}

impl NsqConfig {
    /// Загружает настройки: значения по умолчанию, затем файл из
    /// `NSQLINK_CONFIG` (если задан), затем окружение `NSQ_*`.
    ///
    /// Вложенные поля задаются через `__`: `NSQ_MESSAGE_BACKOFF__MIN=500`.
    /// Списки разделяются запятыми: `NSQ_LOOKUPD_ADDRS=http://a:4161,http://b:4161`.
    pub fn load() -> NsqResult<Self> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&path).required(true));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix("NSQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("lookupd_addrs")
                    .with_list_parse_key("topics"),
            )
            .build()
            .map_err(config_error)?;

        let settings: NsqConfig = cfg.try_deserialize().map_err(config_error)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Отклоняет значения, с которыми клиент не сможет работать.
    pub fn validate(&self) -> NsqResult<()> {
        let fail = |reason: &str| -> NsqResult<()> {
            Err(NsqError::Config {
                reason: reason.to_string(),
            }
            .into())
        };

        if !(0.0..=1.0).contains(&self.message_backoff.jitter) {
            return fail("message_backoff.jitter must be within [0, 1]");
        }
        if self.message_backoff.factor < 1.0 {
            return fail("message_backoff.factor must be >= 1");
        }
        if self.message_backoff.max != 0 && self.message_backoff.max < self.message_backoff.min {
            return fail("message_backoff.max must be >= message_backoff.min");
        }
        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return fail("lookupd_poll_jitter must be within [0, 1]");
        }
        if self.lookupd_poll_interval == 0 || self.rdy_redistribute_interval == 0 {
            return fail("poll and redistribute intervals must be positive");
        }
        if self.nsqd_connect_timeout == 0 || self.publish_timeout == 0 {
            return fail("timeouts must be positive");
        }
        if self.packet_size_limit < 8 {
            return fail("packet_size_limit is too small");
        }
        if self.max_connection_per_topic == 0 {
            return fail("max_connection_per_topic must be positive");
        }
        Ok(())
    }

    pub fn nsqd_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.nsqd_connect_timeout)
    }

    pub fn nsqlookupd_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.nsqlookupd_connect_timeout)
    }

    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lookupd_poll_interval)
    }

    pub fn lookupd_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.lookupd_retry_sleep)
    }

    pub fn delaying_close_time(&self) -> Duration {
        Duration::from_millis(self.delaying_close_time)
    }

    pub fn rdy_redistribute_interval(&self) -> Duration {
        Duration::from_millis(self.rdy_redistribute_interval)
    }

    pub fn rdy_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rdy_retry_delay)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay)
    }

    pub fn low_rdy_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.low_rdy_idle_timeout)
    }

    pub fn max_backoff_duration(&self) -> Duration {
        Duration::from_millis(self.max_backoff_duration)
    }

    pub fn max_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.max_requeue_delay)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout)
    }

    pub fn disposable_connection_lifecycle(&self) -> Duration {
        Duration::from_millis(self.disposable_connection_lifecycle)
    }
}

fn config_error(e: config::ConfigError) -> nsqlink_error::StackError {
    NsqError::Config {
        reason: e.to_string(),
    }
    .into()
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
