//! Настройки клиента.
//!
//! `NsqConfig` собирает все параметры протокола, пула соединений и
//! backoff. Загружается через crate `config`: значения по умолчанию,
//! необязательный файл и переменные окружения с префиксом `NSQ`.

mod settings;

pub use settings::{BackoffConfig, IdentifyConfig, NsqConfig, CONFIG_PATH_ENV};
