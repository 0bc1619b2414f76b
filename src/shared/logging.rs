use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use chrono::{SecondsFormat, Utc};
use env_logger::{Builder, Env, Target};

use crate::shared::config::{self, LogFormat, LogMode, LoggingConfig};

static INIT: Once = Once::new();

/// Installs the global `env_logger` backend once.
///
/// Format (`LOG_FORMAT`) and destination (`LOG_MODE`, `LOG_DIR`,
/// `LOG_FILE_NAME`) come from [`config::logging_config`]; the level filter from
/// `RUST_LOG`, defaulting to `info`. Problems opening the log file fall back to
/// stdout and are reported once the logger is up. Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let (mut builder, warnings) = build(config::logging_config());
        let _ = builder.try_init();
        for warning in warnings {
            log::warn!("{}", warning);
        }
    });
}

/// Test-friendly logger: captured by the harness, debug level.
pub fn init_for_tests() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

fn build(cfg: &LoggingConfig) -> (Builder, Vec<String>) {
    let mut warnings = Vec::new();
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    let format = cfg.format.clone();
    builder.format(move |buf, record| {
        let line = render_line(
            &format,
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            &record.level().to_string(),
            record.target(),
            &record.args().to_string(),
        );
        writeln!(buf, "{}", line)
    });

    match (&cfg.mode, cfg.dir.as_deref()) {
        (LogMode::File, Some(dir)) => match open_log_file(Path::new(dir), &cfg.file_name) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(err) => {
                warnings.push(err);
                builder.target(Target::Stdout);
            }
        },
        _ => {
            builder.target(Target::Stdout);
        }
    }

    (builder, warnings)
}

fn open_log_file(dir: &Path, file_name: &str) -> Result<std::fs::File, String> {
    std::fs::create_dir_all(dir)
        .map_err(|err| format!("[logging] failed to create log dir {}: {}", dir.display(), err))?;
    let path = dir.join(file_name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("[logging] failed to open log file ({}): {}", path.display(), err))
}

fn render_line(format: &LogFormat, ts: &str, level: &str, target: &str, msg: &str) -> String {
    match format {
        LogFormat::Json => serde_json::json!({
            "ts": ts,
            "level": level,
            "target": target,
            "msg": msg,
        })
        .to_string(),
        LogFormat::Text => format!("{} {} {} {}", ts, level, target, msg),
    }
}
