use anyhow::anyhow;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";
/// Dependency targets whose handshake chatter is capped below `trace`.
const NOISY_TARGETS: &[&str] = &["rustls", "hyper", "hyper_util", "tokio_rustls"];

pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let log_level = resolve_log_level(config, cli_level_override)?;
    let filter = targets_for_level(log_level);
    let registry = tracing_subscriber::registry().with(filter);

    match resolve_log_format(config) {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).pretty())
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn targets_for_level(level: LevelFilter) -> Targets {
    let dependency_level = if level == LevelFilter::TRACE {
        LevelFilter::TRACE
    } else {
        level.min(LevelFilter::WARN)
    };
    NOISY_TARGETS
        .iter()
        .fold(Targets::new().with_default(level), |targets, target| {
            targets.with_target(*target, dependency_level)
        })
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
