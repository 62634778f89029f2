//! Accel CLI - accelerator pod fleet management for this host.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use accel::{
    detect_software_version, is_pid_alive, ClaimLedger, CommandRunner, Config, EnvRegistry,
    FleetContext, FleetManager, ProvisionRequest, RetryPolicy, ShellRunner,
};

/// Accel CLI - Manage the accelerator pods leased by this host.
#[derive(Parser)]
#[command(name = "accel")]
#[command(about = "Track, provision and clean up accelerator pods for this host")]
struct Cli {
    /// Config file (or set `ACCEL_CFG`); defaults to `~/accel.toml` then
    /// `/etc/accel.toml`.
    #[arg(long, env = "ACCEL_CFG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List this host's pods as the provider reports them.
    List,

    /// Show one pod's describe output.
    Describe {
        /// Pod name.
        #[arg(long)]
        name: String,
    },

    /// Provision a new pod.
    Create {
        /// Explicit pod name (defaults to `<host>-<random suffix>`).
        #[arg(long)]
        name: Option<String>,

        /// Accelerator version, e.g. `v3-8` (defaults from config).
        #[arg(long)]
        version: Option<String>,

        /// Request an on-demand pod even when config says preemptible.
        #[arg(long, default_value = "false")]
        on_demand: bool,

        /// Zone override for this pod.
        #[arg(long)]
        zone: Option<String>,

        /// Create attempts before giving up.
        #[arg(long)]
        attempts: Option<u32>,

        /// Don't wait for the provider operation to finish.
        #[arg(long, default_value = "false")]
        background: bool,
    },

    /// Start a stopped pod.
    Start {
        /// Pod name.
        #[arg(long)]
        name: String,

        /// Don't wait for the provider operation to finish.
        #[arg(long, default_value = "false")]
        background: bool,
    },

    /// Stop a pod without deleting it.
    Stop {
        /// Pod name.
        #[arg(long)]
        name: String,

        /// Don't wait for the provider operation to finish.
        #[arg(long, default_value = "false")]
        background: bool,
    },

    /// Delete one pod, or the whole fleet.
    Delete {
        /// Pod name.
        #[arg(long)]
        name: Option<String>,

        /// Delete every pod belonging to this host.
        #[arg(long, default_value = "false")]
        all: bool,

        /// Skip confirmation prompt.
        #[arg(long, short = 'y', default_value = "false")]
        yes: bool,

        /// Don't wait for the provider operation to finish.
        #[arg(long, default_value = "false")]
        background: bool,
    },

    /// Reconcile with the provider and delete unusable pods.
    Clean {
        /// Don't wait for the provider operations to finish.
        #[arg(long, default_value = "false")]
        background: bool,
    },

    /// Show the claim ledger.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => Config::discover().context(
            "No config file found; set ACCEL_CFG or create ~/accel.toml or /etc/accel.toml",
        )?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    ensure_provider_cli(&config)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let env = EnvRegistry::with_defaults()
        .create(&config, &runner)
        .context("Failed to build the host environment")?;

    let host = match &config.host {
        Some(host) => host.clone(),
        None => env
            .host_name()
            .await
            .context("Failed to determine the host name")?,
    };
    let zone = match &config.zone {
        Some(zone) => Some(zone.clone()),
        None => env.zone().await.context("Failed to determine the zone")?,
    };
    let software_version = match &config.software_version {
        Some(version) => version.clone(),
        None => detect_software_version(runner.as_ref()).await,
    };

    let ledger =
        ClaimLedger::open(config.ledger_path()).context("Failed to open the claim ledger")?;

    let ctx = Arc::new(FleetContext {
        runner,
        ledger,
        host,
        zone,
        software_version,
        cli_root: config.pod_cli.clone(),
        retry: RetryPolicy::with_attempts(config.attempts),
    });
    let mut fleet = FleetManager::new(Arc::clone(&ctx));

    match cli.command {
        Commands::List => {
            fleet.collect_existing().await?;

            println!(
                "\n{:<28} {:<9} {:<16} {:<12} {:<8}",
                "NAME", "VERSION", "IP", "PREEMPTIBLE", "CLAIMED"
            );
            println!("{}", "-".repeat(78));

            for pod in fleet.pods() {
                let claimed = ctx.ledger.check_if_in_use(pod.name())?;
                println!(
                    "{:<28} {:<9} {:<16} {:<12} {}",
                    pod.name(),
                    pod.version().unwrap_or("-"),
                    pod.ip().unwrap_or("-"),
                    if pod.preemptible() { "yes" } else { "no" },
                    if claimed { "🔒" } else { "" }
                );
            }
            println!();
        }

        Commands::Describe { name } => {
            let pod = fleet.add_named(&name).await?;
            let details = pod.details().await?;

            println!("\n🖥️  Pod: {}", pod.name());
            println!(
                "   State:    {}",
                details.state.map_or_else(|| "-".to_string(), |s| s.to_string())
            );
            println!(
                "   Health:   {}",
                details.health.map_or_else(|| "-".to_string(), |h| h.to_string())
            );
            println!("   Version:  {}", pod.version().unwrap_or("-"));
            println!("   IP:       {}", pod.ip().unwrap_or("-"));
            println!(
                "   Usable:   {}",
                if details.is_running() && details.is_healthy() {
                    "yes"
                } else {
                    "no"
                }
            );
            println!(
                "   Fetched:  {}",
                details.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }

        Commands::Create {
            name,
            version,
            on_demand,
            zone,
            attempts,
            background,
        } => {
            let version = version.unwrap_or_else(|| config.accelerator_version.clone());
            info!(version = %version, "Provisioning pod");

            let mut req = ProvisionRequest::default()
                .with_version(version)
                .with_preemptible(config.preemptible && !on_demand)
                .with_background(background)
                .with_attempts(attempts.unwrap_or(config.attempts));
            if let Some(name) = name {
                req = req.with_name(name);
            }
            if let Some(zone) = zone {
                req = req.with_zone(zone);
            }

            let pod = fleet.up(req).await?;

            println!("\n✅ Pod created successfully!");
            println!("   Name:    {}", pod.name());
            println!("   Version: {}", pod.version().unwrap_or("-"));
            println!("   IP:      {}", pod.ip().unwrap_or("-"));
        }

        Commands::Start { name, background } => {
            let pod = fleet.add_named(&name).await?;
            pod.up(background).await?;
            println!("\n✅ Pod {} started", pod.name());
        }

        Commands::Stop { name, background } => {
            let pod = fleet.add_named(&name).await?;
            pod.down(background).await?;
            println!("\n✅ Pod {} stopped", pod.name());
        }

        Commands::Delete {
            name,
            all,
            yes,
            background,
        } => {
            if !yes {
                println!("⚠️  Deleting provider resources cannot be undone.");
                println!("   Use --yes to confirm.");
                return Ok(());
            }

            if let Some(name) = name {
                let pod = fleet.add_named(&name).await?;
                fleet.remove(&name);
                pod.delete_remote(background).await?;
                println!("\n✅ Pod {name} deleted");
            } else if all {
                fleet.collect_existing().await?;
                let count = fleet.pods().len();
                fleet.delete(background).await;
                println!("\n✅ Deleted {count} pods");
            } else {
                anyhow::bail!("Pass --name <pod> or --all");
            }
        }

        Commands::Clean { background } => {
            fleet.refresh(background).await?;

            println!("\n🧹 Fleet cleaned, {} usable pods remain", fleet.pods().len());
            for name in fleet.names() {
                println!("   {name}");
            }
        }

        Commands::Status => {
            let claims = ctx.ledger.snapshot()?;

            println!("\n📒 Claim ledger: {}", ctx.ledger.path().display());
            if claims.is_empty() {
                println!("   No pods claimed.");
            } else {
                for (name, pid) in claims {
                    let marker = if is_pid_alive(pid) {
                        "🟢 live"
                    } else {
                        "⚪ stale"
                    };
                    println!("   {name:<28} pid {pid:<8} {marker}");
                }
            }
            println!();
        }
    }

    Ok(())
}

fn ensure_provider_cli(config: &Config) -> Result<()> {
    let Some(program) = config.pod_cli.first() else {
        anyhow::bail!("Config key 'pod_cli' must name the provider CLI, e.g. gcloud compute tpus");
    };

    let probe = Command::new(program).arg("--version").output();
    match probe {
        Ok(out) if out.status.success() => Ok(()),
        _ => anyhow::bail!("Provider CLI `{program}` not found. Install it and retry."),
    }
}
