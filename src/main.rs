use anyhow::{bail, Context};
use anyproxy::config::Config;
use anyproxy::config_validation::{ConfigValidator, ValidationResult};
use anyproxy::logging::{self, Logger};
use anyproxy::shutdown::{self, Shutdown};
use anyproxy::{ForwardingHandler, ProxyServer};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[clap(
    version,
    about = "Forwarding proxy: GET /<target-url> fetches an allowlisted target and relays the response"
)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy
    Run {
        #[clap(short, long, value_name = "FILE", default_value = "config.yml", help = "Configuration file path")]
        config: PathBuf,
    },
    /// Load and validate a configuration file, then print the findings
    Check {
        #[clap(short, long, value_name = "FILE", default_value = "config.yml", help = "Configuration file path")]
        config: PathBuf,
    },
    /// Write a sample configuration file
    GenerateConfig {
        #[clap(value_name = "FILE")]
        file: PathBuf,
    },
}

const SAMPLE_CONFIG: &str = r#"# Address and port the proxy listens on.
listen: 127.0.0.1
port: 8080

# Hostnames that may be fetched. Requests for any other host get 403.
allowance:
  - github.com
  - raw.githubusercontent.com

# Download attempts per request.
attempt: 3

# Outbound timeouts in seconds.
timeout:
  connect: 10
  tls-handshake: 10
  response-header: 30
  overall: 30

log:
  level: info
  format: text
  targets:
    - type: stdout
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config } => run(&config).await,
        Command::Check { config } => check(&config),
        Command::GenerateConfig { file } => {
            std::fs::write(&file, SAMPLE_CONFIG)
                .with_context(|| format!("failed to write {}", file.display()))?;
            println!("Sample configuration file generated: {}", file.display());
            Ok(())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        bail!("Configuration file not found: {}", path.display());
    }
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let result = ConfigValidator::validate(&config);

    for error in &result.errors {
        println!("error: {}", error);
    }
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for suggestion in &result.suggestions {
        println!("suggestion: {}", suggestion);
    }

    if !result.is_valid {
        bail!("{} configuration error(s) in {}", result.errors.len(), path.display());
    }
    println!("{} is valid", path.display());
    Ok(())
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;

    let level = logging::level_override(std::env::var("LOG_LEVEL").ok().as_deref());
    let sink = logging::build_sink(config.log.as_ref(), level).context("failed to set up logging")?;
    let logger = Logger::new(sink);

    let result = ConfigValidator::validate(&config);
    report(&logger, &result);
    if !result.is_valid {
        logger.flush();
        bail!("invalid configuration in {}", path.display());
    }

    logger.info(format_args!(
        "starting proxy allowance={} attempt={}",
        config.allowance.len(),
        config.max_attempts()
    ));

    let handler = ForwardingHandler::from_config(&config, logger.clone())?;
    let server = ProxyServer::bind(&config, handler, logger.clone()).await?;

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown::watch_signals(shutdown.clone(), logger.clone()));

    let served = server.serve(shutdown).await;
    logger.flush();
    served?;
    Ok(())
}

fn report(logger: &Logger, result: &ValidationResult) {
    for error in &result.errors {
        logger.error(format_args!("config error: {}", error));
    }
    for warning in &result.warnings {
        logger.warn(format_args!("config warning: {}", warning));
    }
    for suggestion in &result.suggestions {
        logger.info(format_args!("config suggestion: {}", suggestion));
    }
}
