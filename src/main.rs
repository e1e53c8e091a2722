//! simbus-master: брокер simbus.
//!
//! Загружает настройки, поднимает логирование и исполнитель, затем
//! обслуживает узлы до Ctrl-C.

use std::{path::PathBuf, process};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use simbus::{
    broker::{Broker, LateSubscriberPolicy},
    config::Settings,
    logging::init_logging,
    network::IoExecutor,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "simbus-master")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "simbus broker: matches topic publishers with subscribers", long_about = None)]
struct Cli {
    /// TOML-файл настроек
    #[arg(short, long, env = "SIMBUS_CONFIG")]
    config: Option<PathBuf>,
    /// Адрес слушающего сокета, например 0.0.0.0:11345
    #[arg(short, long)]
    listen: Option<String>,
    /// Политика для подписчиков, пришедших раньше издателя
    #[arg(long, value_enum)]
    late_subscribers: Option<PolicyArg>,
    /// Уровень логирования или директива фильтра
    #[arg(long)]
    log_level: Option<String>,
    /// Число рабочих потоков
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    RequestTimeOnly,
    NotifyOnAnnounce,
}

impl From<PolicyArg> for LateSubscriberPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::RequestTimeOnly => Self::RequestTimeOnly,
            PolicyArg::NotifyOnAnnounce => Self::NotifyOnAnnounce,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(listen) = cli.listen {
        settings.broker.listen = listen;
    }
    if let Some(policy) = cli.late_subscribers {
        settings.broker.late_subscriber_policy = policy.into();
    }
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    if let Some(workers) = cli.workers {
        settings.executor.worker_threads = workers.max(1);
    }

    let logging = init_logging(settings.logging.clone())?;

    let executor = IoExecutor::new(settings.executor.clone());
    if let Err(e) = executor.start() {
        error!("Failed to start I/O executor: {e}");
        logging.shutdown();
        process::exit(1);
    }

    let broker = Broker::new(settings.broker_config(), &executor);
    let outcome = executor.block_on(run(&broker));

    executor.stop();
    logging.shutdown();
    outcome??;
    Ok(())
}

async fn run(broker: &Broker) -> Result<()> {
    let addr = broker.start().await.context("failed to start broker")?;
    info!(address = %addr, "simbus-master ready, press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    broker.stop();
    signal.context("failed to listen for Ctrl-C")?;
    info!("simbus-master stopped");
    Ok(())
}
