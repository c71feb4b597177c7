//! deadline-push - deadline reminder and Web Push delivery daemon.
//!
//! This is the main binary entry point. See the `deadline_push` library
//! for the core functionality.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use deadline_push::constants::VERSION;
use deadline_push::notifications::signer::PushSigner;
use deadline_push::notifications::vapid::VapidKeys;
use deadline_push::{daemon, Config, Daemon, DeliveryReport, NotifyKind};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "deadline-push")]
#[command(version = VERSION)]
#[command(about = "Deadline reminder scheduler and Web Push delivery daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and delivery workers until SIGINT/SIGTERM
    Run,
    /// Generate a fresh VAPID key pair
    GenerateKeys,
    /// Validate the configured VAPID keys and run the signing self-test
    CheckKeys,
    /// Send a direct notification to one user
    Notify {
        /// Recipient user id
        #[arg(long)]
        user: i64,
        /// Notification kind
        #[arg(long, value_enum, default_value_t = Kind::Test)]
        kind: Kind,
    },
    /// Run a single scheduler tick and wait for its deliveries
    Tick,
    /// Remove ledger records past their retention
    Prune,
    /// Print the effective configuration (private key omitted)
    Config {
        /// Write the effective configuration to config.json
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Test,
    Welcome,
}

impl From<Kind> for NotifyKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Test => Self::Test,
            Kind::Welcome => Self::Welcome,
        }
    }
}

fn init_logging() {
    let env = deadline_push::env::Environment::current();
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(env.default_log_filter()));
    builder.format_timestamp_secs();

    // Log to a file when DEADLINE_PUSH_LOG_FILE is set, stderr otherwise
    if let Ok(path) = std::env::var("DEADLINE_PUSH_LOG_FILE") {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Warning: could not open log file {path}: {e}; logging to stderr"),
        }
    }
    builder.init();

    // Set up panic hook to log panics before the default handler prints them
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));
}

fn print_report(report: &DeliveryReport) {
    match report {
        DeliveryReport::Delivered { attempts } => println!("Delivered ({} attempt(s))", attempts),
        DeliveryReport::InvalidSubscription(reason)
        | DeliveryReport::PreDeliveryFailed(reason)
        | DeliveryReport::Rejected(reason)
        | DeliveryReport::GaveUp(reason)
        | DeliveryReport::Skipped(reason) => println!("{}: {}", report.label(), reason),
        DeliveryReport::NoSubscription | DeliveryReport::AlreadyFired | DeliveryReport::EndpointGone => {
            println!("{}", report.label());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            println!("Starting deadline-push v{}...", VERSION);
            let daemon = Daemon::new(Config::load()?)?;
            let report = daemon.run(daemon::shutdown_signal()).await?;
            if !report.drained {
                eprintln!(
                    "Forced shutdown: {} deliveries in flight (see log)",
                    report.abandoned.len()
                );
            }
        }
        Commands::GenerateKeys => {
            let keys = VapidKeys::generate();
            println!("DEADLINE_PUSH_VAPID_PUBLIC_KEY={}", keys.public_key_base64url());
            println!("DEADLINE_PUSH_VAPID_PRIVATE_KEY={}", keys.private_key_base64url());
        }
        Commands::CheckKeys => {
            let config = Config::load()?;
            let keys = config.vapid_keys()?;
            let signer = PushSigner::new(
                &keys,
                config.vapid_subject.clone(),
                std::time::Duration::from_secs(config.token_ttl_secs),
            )?;
            signer.self_test().context("VAPID self-test failed")?;
            println!("VAPID keys OK (public key {})", keys.public_key_base64url());
        }
        Commands::Notify { user, kind } => {
            let daemon = Daemon::new(Config::load()?)?;
            let report = daemon.notify(user, kind.into()).await?;
            print_report(&report);
            if !matches!(report, DeliveryReport::Delivered { .. }) {
                std::process::exit(1);
            }
        }
        Commands::Tick => {
            let daemon = Daemon::new(Config::load()?)?;
            let (tick, shutdown) = daemon.tick_once().await?;
            println!(
                "Enqueued {}, suppressed {}, already fired {}, unsubscribed {}, dropped {}, pruned {}",
                tick.enqueued.len(),
                tick.suppressed,
                tick.already_fired,
                tick.unsubscribed,
                tick.dropped,
                tick.pruned
            );
            for sweep in &tick.failed_sweeps {
                eprintln!("Sweep failed: {}", sweep);
            }
            if !shutdown.drained || !tick.is_clean() {
                std::process::exit(1);
            }
        }
        Commands::Prune => {
            let daemon = Daemon::new(Config::load()?)?;
            let removed = daemon.prune().await?;
            println!("Pruned {} ledger records", removed);
        }
        Commands::Config { save } => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
        }
    }

    Ok(())
}
