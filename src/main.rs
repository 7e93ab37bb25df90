use clap::Parser;
use sshsync_lib::logging::{LogConfig, SizeRotatingWriter};
use sshsync_lib::{create_session, OutcomeCode, SyncConfig, SyncEngine, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// 增量拉取远端目录中的新文件
#[derive(Parser, Debug)]
#[command(name = "sshsync", version, about = "Incremental SFTP pull synchronizer")]
struct Cli {
    /// Remote host (`local` uses the local filesystem)
    #[arg(short = 's', long)]
    host: Option<String>,

    /// SSH port
    #[arg(long)]
    port: Option<u16>,

    /// SSH user name
    #[arg(short = 'u', long = "user")]
    username: Option<String>,

    /// SSH password
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Private key file, takes precedence over the password
    #[arg(short = 'k', long = "key")]
    private_key: Option<PathBuf>,

    /// Remote directory, or `file://<dir>` for a mounted directory
    #[arg(short = 'r', long = "remote")]
    remote_path: Option<String>,

    /// Local destination directory
    #[arg(short = 'd', long = "dest")]
    local_path: Option<PathBuf>,

    /// Catalog file; without it every matching file is fetched
    #[arg(short = 'c', long = "catalog")]
    catalog_file: Option<PathBuf>,

    /// Maximum catalog rows kept after a run (<= 0 keeps everything)
    #[arg(long = "catalog-rows", allow_negative_numbers = true)]
    catalog_max_rows: Option<i64>,

    /// File name wildcard
    #[arg(short = 'w', long)]
    pattern: Option<String>,

    /// Connect timeout in milliseconds (0 disables it)
    #[arg(long = "timeout")]
    connect_timeout_ms: Option<u64>,

    /// List only; check that the destination is writable
    #[arg(long = "test")]
    test_mode: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Extra fetch attempts per file
    #[arg(long = "retries")]
    max_retries: Option<u32>,

    /// JSON config file (`sync` and `log` sections)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// 命令行参数覆盖配置文件中的值
    fn apply(self, config: &mut SyncConfig) {
        if let Some(v) = self.host {
            config.host = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.username {
            config.username = v;
        }
        if let Some(v) = self.password {
            config.password = Some(v);
        }
        if let Some(v) = self.private_key {
            config.private_key = Some(v);
        }
        if let Some(v) = self.remote_path {
            config.remote_path = v;
        }
        if let Some(v) = self.local_path {
            config.local_path = v;
        }
        if let Some(v) = self.catalog_file {
            config.catalog_file = Some(v);
        }
        if let Some(v) = self.catalog_max_rows {
            config.catalog_max_rows = v;
        }
        if let Some(v) = self.pattern {
            config.pattern = v;
        }
        if let Some(v) = self.connect_timeout_ms {
            config.connect_timeout_ms = v;
        }
        if self.test_mode {
            config.test_mode = true;
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
    }
}

/// 控制台日志层，输出到 stderr 以免与 `--json` 报告混在一起
fn console_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
}

/// 初始化日志系统，返回的 guard 需要保持到进程结束
fn init_logging(config: &LogConfig, debug: bool) -> Option<WorkerGuard> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if !config.enabled {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer())
            .try_init();
        return None;
    }

    let log_dir = config.log_dir();
    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);

            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer())
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，只输出到控制台
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer())
                .try_init();
            warn!("无法创建日志目录 {:?}: {}", log_dir, e);
            None
        }
    }
}

async fn run(cli: Cli, config_file: Option<PathBuf>, explicit_config: bool) -> OutcomeCode {
    let json = cli.json;

    let mut config = match config_file.as_deref() {
        Some(path) if explicit_config || path.exists() => match SyncConfig::load(path) {
            Ok(config) => config,
            Err(e) => return fail(&e),
        },
        _ => SyncConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        return fail(&e);
    }
    info!("配置: {:?}", config);

    let session = create_session(&config);
    let mut engine = match SyncEngine::new(config, session) {
        Ok(engine) => engine,
        Err(e) => return fail(&e),
    };

    let result = engine.run_sync().await;
    let mut outcome = result.outcome;

    if result.is_success() {
        if let Err(e) = engine.disconnect().await {
            outcome = fail(&e);
        }
    }

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("无法序列化同步报告: {}", e),
        }
    }

    info!("结果: {} ({})", outcome, outcome.legacy_code());
    outcome
}

fn fail(err: &SyncError) -> OutcomeCode {
    let code = err.outcome();
    error!("{} [{} / {}]", err, code, code.legacy_code());
    code
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let explicit_config = cli.config.is_some();
    let config_file = cli
        .config
        .clone()
        .or_else(sshsync_lib::dirs::default_config_file);

    let log_config = LogConfig::load(config_file.as_deref());
    let _guard = init_logging(&log_config, cli.debug);

    let outcome = run(cli, config_file, explicit_config).await;
    ExitCode::from(outcome.exit_code() as u8)
}
