mod actions;
mod collectors;
mod config;
mod format;
mod scheduler;
mod state;
mod store;
mod telegram;

use clap::Parser;
use config::Config;
use state::AppState;
use store::StatusStore;
use teloxide::Bot;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tg-control-agent")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let token = match cfg.telegram.resolve_token() {
        Ok(token) => token,
        Err(err) => {
            error!(error = %err, "не удалось подготовить настройки Telegram");
            std::process::exit(1);
        }
    };

    if cfg.telegram.admin_ids.is_empty() {
        warn!("telegram.admin_ids пуст: любой пользователь считается администратором");
    }

    info!(
        interval_secs = cfg.interval_secs,
        store = %cfg.store_path.display(),
        "запуск tg-control-agent"
    );

    let store = StatusStore::load(&cfg.store_path);
    let state = AppState::new(cfg, store);
    let bot = Bot::new(token);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telegram_task = {
        let bot = bot.clone();
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = telegram::run_bot(bot, state, shutdown).await {
                error!(error = %err, "ошибка задачи Telegram");
            }
        })
    };

    let scheduler_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler::run(bot, state, shutdown).await;
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = scheduler_task.await;
    let _ = telegram_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
