//! nsq-lookup
//!
//! Запрашивает у nsqlookupd узлы nsqd, обслуживающие топик, и печатает
//! их адреса.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use nsqlink::{
    client::{normalize_address, Access, HttpLookupdClient, LookupdClient},
    init_logging, LogFormat, LoggingConfig,
};

#[derive(Parser)]
#[command(name = "nsq-lookup")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Query nsqlookupd for the nsqd nodes of a topic", long_about = None)]
struct Cli {
    /// Топик
    topic: String,
    /// HTTP-адрес nsqlookupd
    #[arg(short, long, default_value = "http://127.0.0.1:4161", env = "NSQ_LOOKUPD")]
    lookupd: String,
    /// Режим доступа: узлы для чтения или для записи
    #[arg(short, long, value_enum, default_value = "read")]
    access: AccessArg,
    /// Таймаут запроса в миллисекундах
    #[arg(long, default_value = "3000")]
    timeout: u64,
    /// Печатать ответ lookupd целиком в JSON
    #[arg(long)]
    json: bool,
    /// Подробный вывод
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum AccessArg {
    Read,
    Write,
}

impl From<AccessArg> for Access {
    fn from(a: AccessArg) -> Self {
        match a {
            AccessArg::Read => Access::Read,
            AccessArg::Write => Access::Write,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LoggingConfig {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        format: LogFormat::Compact,
        ..Default::default()
    })?;

    let addr = normalize_address(&cli.lookupd)?;
    let client = HttpLookupdClient::new(Duration::from_millis(cli.timeout))?;
    let data = client
        .lookup(&addr, &cli.topic, cli.access.into())
        .await
        .with_context(|| format!("lookup {} at {addr}", cli.topic))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if data.producers.is_empty() {
        println!("no nsqd nodes for topic {}", cli.topic);
    }
    for node in &data.producers {
        println!("{}", node.addr());
    }
    if let Some(partitions) = &data.partitions {
        for (partition, node) in partitions {
            println!("partition {partition}: {}", node.addr());
        }
    }
    Ok(())
}
