use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tapproxy::{
    ca,
    config::{Config, DEFAULT_COMMON_NAME},
    logging,
};

#[derive(Debug, Parser)]
#[command(name = "tapproxy", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the intercepting proxy and the replay API.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Manage the local certificate authority.
    Ca {
        #[command(subcommand)]
        action: CaCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum CaCommand {
    /// Generate a CA certificate and private key.
    Generate {
        /// Directory receiving `cert.pem` and `key.pem`.
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value = DEFAULT_COMMON_NAME)]
        common_name: String,
        /// Overwrite existing CA material.
        #[arg(long)]
        force: bool,
    },
    /// Copy the CA certificate somewhere a client trust store can import it.
    Export {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

fn run_ca_command(action: CaCommand) -> anyhow::Result<String> {
    match action {
        CaCommand::Generate {
            dir,
            common_name,
            force,
        } => {
            let paths = ca::generate_ca(&dir, &common_name, force)?;
            Ok(format!(
                "generated CA `{common_name}`: cert={}, key={}",
                paths.cert_path.display(),
                paths.key_path.display()
            ))
        }
        CaCommand::Export { dir, out, force } => {
            let out = out.unwrap_or_else(|| default_export_path(&dir));
            let exported = ca::export_ca_cert(&dir, &out, force)?;
            Ok(format!("exported CA certificate to {}", exported.display()))
        }
    }
}

fn default_export_path(dir: &Path) -> PathBuf {
    dir.join(ca::DEFAULT_EXPORT_CERT_FILE_NAME)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let proxy = tapproxy::proxy::serve(&config).await?;
            eprintln!(
                "{}",
                startup_summary(&config, proxy.listen_addr, proxy.repeater_addr)
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            proxy.shutdown().await;
        }
        Command::Ca { action } => {
            println!("{}", run_ca_command(action)?);
        }
    }

    Ok(())
}

fn startup_summary(
    config: &Config,
    proxy_listen_addr: std::net::SocketAddr,
    repeater_listen_addr: std::net::SocketAddr,
) -> String {
    format!(
        "startup config: proxy_listen={}, repeater_listen={}, db_path={}, ca_cert={}, ca_key=[REDACTED]",
        proxy_listen_addr,
        repeater_listen_addr,
        config.db.path.display(),
        config.proxy.ca_cert.display(),
    )
}
