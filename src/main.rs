mod agent;
mod config;
mod http;
mod metrics;
mod stats;
mod store;

use agent::logtail::{read_new_lines, KeywordClassifier, LineClassifier, LogCursor};
use agent::NetCounters;
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{AgentConfig, Config};
use http::{ErrorReport, StatusReport};
use metrics::Metrics;
use reqwest::Client;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use store::{clamp_message, Store};
use sysinfo::SystemExt;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const LOG_POLL_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "fleetwatch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Сервер-коллектор: приём отчётов, статистика, тренды.
    Serve {
        #[arg(long, default_value = "./config.yaml")]
        config: String,
        #[arg(long)]
        print_default_config: bool,
    },
    /// Агент на наблюдаемой машине: отчёты о ресурсах и журнале.
    Agent,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            print_default_config,
        } => {
            if print_default_config {
                println!("{}", Config::example_yaml());
                return;
            }
            let cfg = match Config::load_from_file(&config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!(error = %err, "не удалось загрузить конфигурацию");
                    std::process::exit(1);
                }
            };
            run_server(cfg).await;
        }
        Command::Agent => {
            let cfg = match AgentConfig::from_env() {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!(error = %err, "не удалось прочитать настройки агента");
                    std::process::exit(1);
                }
            };
            run_agent(cfg).await;
        }
    }
}

async fn run_server(cfg: Config) {
    info!(
        listen = %cfg.listen,
        stale_threshold_secs = cfg.stale_threshold_secs,
        sweep_interval_secs = cfg.sweep_interval_secs,
        "запуск сервера fleetwatch"
    );

    let store = Arc::new(RwLock::new(Store::new()));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let store = store.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, store);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let sweep_task = {
        let metrics = metrics.clone();
        let store = store.clone();
        let mut shutdown = shutdown_rx.clone();
        let threshold = chrono::Duration::seconds(cfg.stale_threshold_secs as i64);
        let interval_secs = cfg.sweep_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки проверки устройств");
                        break;
                    }
                    _ = ticker.tick() => {
                        let marked = {
                            let mut guard = store.write().await;
                            guard.sweep_stale(Utc::now(), threshold)
                        };
                        metrics.observe_sweep(marked);
                        if marked > 0 {
                            info!(marked, "устройства переведены в оффлайн по таймауту");
                        }
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = sweep_task.await;
    let _ = http_task.await;
}

async fn run_agent(cfg: AgentConfig) {
    info!(
        server_url = %cfg.server_url,
        interval_secs = cfg.report_interval_secs,
        "запуск агента fleetwatch"
    );

    let client = Client::builder()
        .user_agent("fleetwatch/0.1.0")
        .build()
        .unwrap_or_else(|_| Client::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let status_task = {
        let cfg = cfg.clone();
        let client = client.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut system = sysinfo::System::new_all();
            let mut ticker =
                tokio::time::interval(Duration::from_secs(cfg.report_interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut prev_net: Option<NetCounters> = None;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла статус-отчётов");
                        break;
                    }
                    _ = ticker.tick() => {
                        let (snapshot, net) =
                            agent::system::collect_resources(&mut system, prev_net.as_ref(), now_unix());
                        prev_net = Some(net);

                        let public_ip = agent::report::fetch_public_ip(&client).await;
                        let (runtime_status, tokens) = match cfg.sessions_file.as_deref() {
                            Some(path) => match agent::sessions::read_session_tokens(Path::new(path)) {
                                Some(tokens) => (Some("running".to_string()), Some(tokens)),
                                None => (Some("stopped".to_string()), None),
                            },
                            None => (None, None),
                        };

                        let report = StatusReport {
                            api_key: cfg.api_key.clone(),
                            runtime_status,
                            cpu_percent: Some(snapshot.cpu_percent),
                            memory_percent: Some(snapshot.memory_percent),
                            memory_total: Some(snapshot.memory_total),
                            memory_used: Some(snapshot.memory_used),
                            disk_percent: Some(snapshot.disk_percent),
                            disk_total: Some(snapshot.disk_total),
                            disk_used: Some(snapshot.disk_used),
                            upload_speed: Some(snapshot.upload_speed),
                            download_speed: Some(snapshot.download_speed),
                            public_ip,
                            context_tokens: tokens.map(|t| t.context_tokens),
                            total_tokens: tokens.map(|t| t.total_tokens),
                        };
                        agent::report::post_status(&client, &cfg, &report).await;
                        info!(
                            cpu_percent = snapshot.cpu_percent,
                            memory_percent = snapshot.memory_percent,
                            upload_speed = snapshot.upload_speed,
                            download_speed = snapshot.download_speed,
                            total_tokens = report.total_tokens.unwrap_or(0),
                            "статус-отчёт отправлен"
                        );
                    }
                }
            }
        })
    };

    let logtail_task = cfg.log_file.clone().map(|path| {
        let cfg = cfg.clone();
        let client = client.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let classifier = KeywordClassifier;
            let mut cursor = LogCursor::default();
            let source = Path::new(&path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());
            let mut ticker = tokio::time::interval(Duration::from_secs(LOG_POLL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла чтения журнала");
                        break;
                    }
                    _ = ticker.tick() => {
                        let lines = match read_new_lines(Path::new(&path), &mut cursor) {
                            Ok(lines) => lines,
                            Err(err) => {
                                debug!(path = %path, error = %err, "журнал недоступен");
                                continue;
                            }
                        };
                        for line in lines {
                            if let Some(level) = classifier.classify(&line) {
                                let report = ErrorReport {
                                    api_key: cfg.api_key.clone(),
                                    level: level.to_string(),
                                    message: clamp_message(&line),
                                    source: Some(source.clone()),
                                    stack_trace: None,
                                };
                                agent::report::post_error(&client, &cfg, &report).await;
                            }
                        }
                    }
                }
            }
        })
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = status_task.await;
    if let Some(task) = logtail_task {
        let _ = task.await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
