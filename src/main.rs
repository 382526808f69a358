//! Binary entrypoint for the meshbridge CLI.
//!
//! Commands:
//! - `start` - connect the enabled networks and serve until Ctrl-C
//! - `init` - write a starter `config.toml`
//!
//! Exit codes: 0 on clean shutdown, 2 when the configuration is invalid or no
//! configured network could be set up.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshbridge::bot::{BotError, BridgeBot};
use meshbridge::config::Config;

#[derive(Parser)]
#[command(name = "meshbridge")]
#[command(about = "Bot bridging Meshtastic and MeshCore radio networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot
    Start {
        /// Primary radio: serial path or host:port
        #[arg(long)]
        primary_device: Option<String>,
        /// Companion radio: serial path or host:port
        #[arg(long)]
        companion_device: Option<String>,
        /// Extra send-only companion lane in frame mode
        #[arg(long)]
        companion_raw_device: Option<String>,
        /// Do not connect the primary network
        #[arg(long)]
        no_primary: bool,
        /// Do not connect the companion network
        #[arg(long)]
        no_companion: bool,
    },
    /// Write a default configuration file
    Init,
}

const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            primary_device,
            companion_device,
            companion_raw_device,
            no_primary,
            no_companion,
        } => {
            let exists = tokio::fs::try_exists(&cli.config).await.unwrap_or(false);
            let loaded = if exists {
                Config::load(&cli.config).await
            } else {
                Ok(Config::default())
            };
            let mut config = match loaded {
                Ok(c) => c,
                Err(e) => {
                    init_logging(&None, cli.verbose);
                    error!("{}", e);
                    std::process::exit(EXIT_CONFIG);
                }
            };
            // CLI overrides: a device flag enables its network, a --no flag always wins
            if let Some(dev) = primary_device {
                config.primary.device = dev;
                config.primary.enabled = true;
            }
            if let Some(dev) = companion_device {
                config.companion.device = dev;
                config.companion.enabled = true;
            }
            if let Some(dev) = companion_raw_device {
                config.companion.raw_device = Some(dev);
                config.companion.enabled = true;
            }
            if no_primary {
                config.primary.enabled = false;
            }
            if no_companion {
                config.companion.enabled = false;
            }
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshbridge v{}", env!("CARGO_PKG_VERSION"));
            if !exists {
                warn!("{} not found; running with defaults", cli.config);
            }

            if let Err(e) = config.validate() {
                error!("Invalid configuration: {}", e);
                std::process::exit(EXIT_CONFIG);
            }
            let mut bot = match BridgeBot::new(config) {
                Ok(bot) => bot,
                Err(e) => {
                    error!("Startup failed: {:#}", e);
                    std::process::exit(EXIT_CONFIG);
                }
            };
            if let Err(e) = bot.run().await {
                error!("{:#}", e);
                bot.shutdown().await;
                if e.downcast_ref::<BotError>().is_some() {
                    std::process::exit(EXIT_CONFIG);
                }
                return Err(e);
            }
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                error!("{} already exists; not overwriting", cli.config);
                std::process::exit(1);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok());
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

        // Mirror to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);

        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());

            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }

            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
