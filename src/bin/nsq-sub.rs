//! nsq-sub
//!
//! Подписывается на `topic/channel` через nsqlookupd и печатает каждое
//! полученное сообщение. Остановка по Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use nsqlink::{init_logging, FnHandler, LogFormat, LoggingConfig, Message, NsqClient, NsqConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "nsq-sub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Subscribe to an NSQ topic and print messages", long_about = None)]
struct Cli {
    /// Топик
    topic: String,
    /// Канал
    channel: String,
    /// HTTP-адрес nsqlookupd, можно указать несколько раз
    #[arg(
        short,
        long = "lookupd",
        env = "NSQ_LOOKUPD_ADDRS",
        value_delimiter = ','
    )]
    lookupd: Vec<String>,
    /// Бюджет RDY
    #[arg(short, long)]
    max_in_flight: Option<u64>,
    /// Возвращать сообщения в очередь вместо FIN
    #[arg(long)]
    requeue: bool,
    /// Формат вывода сообщений
    #[arg(long, value_enum, default_value = "text")]
    output: Output,
    /// Уровень логирования
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Формат логов
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum Output {
    Text,
    Json,
}

fn render(
    msg: &Message,
    output: Output,
) -> String {
    match output {
        Output::Text => format!(
            "{} attempts={} {}",
            msg.id(),
            msg.attempts(),
            String::from_utf8_lossy(msg.body())
        ),
        Output::Json => serde_json::json!({
            "id": msg.id().to_string(),
            "timestamp": msg.timestamp(),
            "attempts": msg.attempts(),
            "partition": msg.partition(),
            "tag": msg.tag(),
            "body": String::from_utf8_lossy(msg.body()),
        })
        .to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
        ..Default::default()
    })?;

    let mut config = NsqConfig::load().context("load settings")?;
    if !cli.lookupd.is_empty() {
        config.lookupd_addrs = cli.lookupd.clone();
    }
    let client = NsqClient::new(config)?;

    let output = cli.output;
    let ack = !cli.requeue;
    let handler = FnHandler::new(move |msg: Arc<Message>| async move {
        println!("{}", render(&msg, output));
        Ok::<_, anyhow::Error>(ack)
    });

    let consumer = client
        .subscribe(&cli.topic, &cli.channel, Arc::new(handler), cli.max_in_flight)
        .await
        .context("subscribe")?;
    info!(topic = %cli.topic, channel = %cli.channel, "waiting for messages, Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("wait for Ctrl+C")?;
    info!(stats = %serde_json::to_string(&consumer.stats())?, "shutting down");
    client.stop().await;
    consumer.wait_closed().await;
    Ok(())
}
