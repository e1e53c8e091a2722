//! CLI клиент simbus
//!
//! Инструмент для работы с топиками: список издателей, печать приходящих
//! сообщений и публикация текстовых сообщений.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simbus::{
    config::{Settings, DEFAULT_MASTER_URI},
    logging::{init_logging, LoggingConfig},
    network::{
        protocol::{Text, TypedMessage},
        Endpoint, IoExecutor,
    },
    transport::{Node, NodeConfig},
};
use tokio::runtime::Handle;
use tracing::debug;

/// Основная структура CLI аргументов
#[derive(Parser)]
#[command(name = "simbus-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "simbus CLI - topic tool for a simbus broker", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Адрес брокера
    #[arg(
        short,
        long,
        env = "SIMBUS_MASTER_URI",
        default_value = DEFAULT_MASTER_URI,
        help = "Адрес брокера в виде host:port"
    )]
    master: String,
    /// Пространство имён для `~` в именах топиков
    #[arg(long, default_value = "default")]
    namespace: String,
    /// Включить подробный вывод (debug)
    #[arg(short, long, help = "Включить подробный вывод для отладки")]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Подкоманды CLI
#[derive(Subcommand)]
enum Commands {
    /// Показать издателей, известных брокеру
    List,
    /// Печатать тег и размер каждого сообщения топика
    Echo {
        topic: String,
    },
    /// Опубликовать текстовое сообщение
    Pub {
        topic: String,
        text: String,
        /// Сколько раз опубликовать
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
        /// Пауза между публикациями
        #[arg(long, default_value = "100")]
        interval_ms: u64,
        /// Сколько ждать первого подписчика
        #[arg(long, default_value = "1000")]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = init_logging(LoggingConfig {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        ..Default::default()
    })?;

    let settings = Settings::load(None).context("failed to load settings")?;
    let master: Endpoint = cli.master.parse().context("invalid master address")?;
    let config = NodeConfig {
        master,
        namespace: cli.namespace.clone(),
        ..settings.node_config()?
    };

    let executor = IoExecutor::attached(Handle::current());
    let node = Node::connect(config, &executor)
        .await
        .context("failed to connect to master")?;
    debug!(endpoint = %node.endpoint(), "Node ready");

    let result = match cli.command {
        Commands::List => {
            list(&node);
            Ok(())
        }
        Commands::Echo { topic } => echo(&node, &topic).await,
        Commands::Pub {
            topic,
            text,
            count,
            interval_ms,
            wait_ms,
        } => {
            publish(
                &node,
                &topic,
                &text,
                count,
                Duration::from_millis(interval_ms),
                Duration::from_millis(wait_ms),
            )
            .await
        }
    };

    node.shutdown();
    logging.shutdown();
    result
}

/// Печатает издателей, сгруппированных по топику.
fn list(node: &Node) {
    let mut publishers = node.all_publishers();
    if publishers.is_empty() {
        println!("No publishers");
        return;
    }
    publishers.sort_by(|a, b| a.topic.cmp(&b.topic).then(a.endpoint.port.cmp(&b.endpoint.port)));

    let mut current: Option<&str> = None;
    for location in &publishers {
        if current != Some(location.topic.as_str()) {
            println!("{} [{}]", location.topic, location.type_tag);
            current = Some(location.topic.as_str());
        }
        println!("    {}", location.endpoint);
    }
}

/// Печатает сообщения топика до Ctrl-C.
async fn echo(
    node: &Node,
    topic: &str,
) -> Result<()> {
    let name = node.decode_topic_name(topic);
    let _subscriber = node.subscribe_raw(topic, move |message| {
        if message.type_tag == Text::TYPE_TAG {
            if let Ok(text) = Text::decode(&message.bytes) {
                println!("[{name}] {}: {}", message.type_tag, text.data);
                return;
            }
        }
        println!(
            "[{name}] {} ({} bytes)",
            message.type_tag,
            message.bytes.len()
        );
    })?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    Ok(())
}

async fn publish(
    node: &Node,
    topic: &str,
    text: &str,
    count: usize,
    interval: Duration,
    wait: Duration,
) -> Result<()> {
    let publisher = node.advertise::<Text>(topic)?;

    let deadline = tokio::time::Instant::now() + wait;
    while !publisher.has_connections() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let message = Text::from(text);
    for i in 0..count {
        let delivered = publisher.publish(&message)?;
        println!("[{}] published #{} to {delivered} subscriber(s)", publisher.topic(), i + 1);
        if i + 1 < count {
            tokio::time::sleep(interval).await;
        }
    }

    // Даём очереди записи уйти в сокет перед закрытием соединений.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
