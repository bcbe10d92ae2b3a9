//! Инициализация `tracing` для приложений, использующих клиент.
//!
//! Сам клиент только пишет события; подписчик устанавливает приложение,
//! обычно один раз при старте через [`init_logging`].

pub mod config;
mod filters;
mod formatter;

pub use config::{LogFormat, LoggingConfig};
use nsqlink_error::{NsqError, NsqResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Устанавливает глобальный подписчик.
///
/// # Возвращает
/// Ошибку `Config`, если подписчик уже установлен.
pub fn init_logging(config: LoggingConfig) -> NsqResult<()> {
    let env_filter = filters::build_filter_from_config(&config);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(formatter::build_console_layer(&config))
        .try_init()
        .map_err(|e| NsqError::Config {
            reason: format!("logging already initialized: {e}"),
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.level,
        format = %config.format,
        "logging initialized"
    );
    Ok(())
}
