use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use hearth::{
    config::{load_or_default, ConfigUpdate},
    core::Core,
    logging,
    sched::Scheduler,
};

#[derive(Parser)]
#[command(author, version, about = "hearth homeserver core")]
struct Cli {
    /// Path to the configuration file. Defaults to ./hearth.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server core
    Start,
    /// Inspect or update the configuration
    Config(ConfigArgs),
    /// Show the server signing key
    Keys,
    /// Print a stored event by id
    Event(EventArgs),
    /// Print a room's resolved state
    State(StateArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Set the server name
    #[arg(long)]
    server_name: Option<String>,
    /// Set the listener port
    #[arg(long)]
    port: Option<u16>,
    /// Set the slice warning threshold in milliseconds
    #[arg(long)]
    slice_warn_ms: Option<u64>,
    /// Set the per-submission deadline in milliseconds
    #[arg(long)]
    submit_deadline_ms: Option<u64>,
}

#[derive(Args)]
struct EventArgs {
    /// Event id, `$...:host`
    event_id: String,
}

#[derive(Args)]
struct StateArgs {
    /// Room id, `!...:host`
    room_id: String,
    /// Restrict to one event type
    #[arg(long)]
    r#type: Option<String>,
    /// Restrict to one state key (requires --type)
    #[arg(long)]
    state_key: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_or_default(cli.config.clone())?;

    match cli.command {
        Commands::Start => {
            logging::init(&config.log_dir())?;
            info!(config = %config_path.display(), "starting");

            let scheduler = Scheduler::new(config.slice_cfg())?;
            scheduler.block_on(async {
                let _core = Core::open(&config)?;
                info!(
                    server = %config.server_name,
                    port = config.listen.port,
                    "core running; press ctrl-c to stop"
                );
                tokio::signal::ctrl_c().await?;
                info!("shutting down");
                Ok::<_, anyhow::Error>(())
            })?;
            Ok(())
        }

        Commands::Config(args) => {
            let update = ConfigUpdate {
                server_name: args.server_name,
                port: args.port,
                slice_warn_ms: args.slice_warn_ms,
                submit_deadline_ms: args.submit_deadline_ms,
                ..ConfigUpdate::default()
            };

            let mut config = config;
            let dirty = update.server_name.is_some()
                || update.port.is_some()
                || update.slice_warn_ms.is_some()
                || update.submit_deadline_ms.is_some();
            if dirty {
                config.apply_update(update);
                config.save(&config_path)?;
            }

            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }

        Commands::Keys => {
            let keys =
                hearth::signing::ServerKeys::load_or_generate(&config.server_name, &config.key_dir())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "server_name": keys.server_name(),
                    "key_id": keys.key_id(),
                    "public_key": keys.public_key_b64(),
                }))?
            );
            Ok(())
        }

        Commands::Event(args) => {
            let scheduler = Scheduler::new(config.slice_cfg())?;
            scheduler.block_on(async {
                let core = Core::open(&config)?;
                match core.query_event(&args.event_id)? {
                    Some(event) => {
                        println!("{}", serde_json::to_string_pretty(&event)?);
                        Ok(())
                    }
                    None => Err(anyhow!("event {} not found", args.event_id)),
                }
            })
        }

        Commands::State(args) => {
            let scheduler = Scheduler::new(config.slice_cfg())?;
            scheduler.block_on(async {
                let core = Core::open(&config)?;
                match (&args.r#type, &args.state_key) {
                    (Some(event_type), state_key) => {
                        let state_key = state_key.as_deref().unwrap_or("");
                        match core.query_state(&args.room_id, event_type, state_key, None)? {
                            Some(event) => {
                                println!("{}", serde_json::to_string_pretty(&event)?)
                            }
                            None => println!("(unset)"),
                        }
                    }
                    (None, _) => {
                        for ((event_type, state_key), idx) in
                            core.dbs().room_state(&args.room_id)?
                        {
                            println!("{event_type} {state_key:?} -> {idx}");
                        }
                    }
                }
                Ok(())
            })
        }
    }
}
