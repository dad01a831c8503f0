//! Sortbot CLI - operator utilities around the core library.
//!
//! The full placement/verification run needs live perception and planning services, so
//! it is driven from an embedding application. These subcommands cover what an operator
//! needs without them: checking planner output, driving the robots by hand, and
//! inspecting or importing calibration data.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sortbot_core::command::audit_plan;
use sortbot_core::dispatch::{dispatch_plan, send_vision_command, LinkSettings, VisionCommand};
use sortbot_core::{CalibrationStore, CalibrationTable, Pixel, Result, RunConfig, SlotSet, DEFAULT_STORE_PATH};

#[derive(Parser, Debug)]
#[command(name = "sortbot", version, about = "Dual-robot sorting utilities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Normalise and validate a file of planner lines without sending anything.
    Check {
        file: PathBuf,
    },
    /// Send a file of planner lines to the worker robot.
    Send {
        #[arg(long, short)]
        config: PathBuf,
        file: PathBuf,
    },
    /// Move the vision robot to a viewpoint.
    Vision {
        #[arg(long, short)]
        config: PathBuf,
        target: VisionTarget,
    },
    /// Resolve a pixel to its nearest calibrated pose.
    Lookup {
        #[arg(long, short)]
        config: PathBuf,
        u: f32,
        v: f32,
    },
    /// Classify a pixel into the nearest container.
    Classify {
        #[arg(long, short)]
        config: PathBuf,
        u: f32,
        v: f32,
    },
    /// Import JSON calibration files into the embedded store.
    Import {
        #[arg(long)]
        table: PathBuf,
        #[arg(long)]
        slots: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_STORE_PATH)]
        store: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VisionTarget {
    Home,
    Bins,
}

impl From<VisionTarget> for VisionCommand {
    fn from(t: VisionTarget) -> Self {
        match t {
            VisionTarget::Home => VisionCommand::Home,
            VisionTarget::Bins => VisionCommand::Bins,
        }
    }
}

fn read_lines(file: &Path) -> Result<Vec<String>> {
    Ok(std::fs::read_to_string(file)?
        .lines()
        .map(str::to_string)
        .collect())
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Check { file } => {
            let audit = audit_plan(&read_lines(&file)?, &[], 0.0);
            for cmd in &audit.accepted {
                println!("{cmd}");
            }
            for rejection in &audit.rejected {
                warn!(line = %rejection.line, reason = %rejection.reason, "rejected");
            }
            info!(accepted = audit.accepted.len(), rejected = audit.rejected.len(), "checked");
        }
        Command::Send { config, file } => {
            let config = RunConfig::load(config)?;
            let audit = audit_plan(
                &read_lines(&file)?,
                &[],
                config.verification.pose_tolerance,
            );
            let settings = LinkSettings::from(&config.network);
            let report =
                dispatch_plan(&config.network.worker.address(), &settings, audit, None).await?;
            info!(sent = report.sent(), rejected = report.rejected.len(), "plan dispatched");
        }
        Command::Vision { config, target } => {
            let config = RunConfig::load(config)?;
            let settings = LinkSettings::from(&config.network);
            send_vision_command(&config.network.vision.address(), &settings, target.into()).await?;
        }
        Command::Lookup { config, u, v } => {
            let table = RunConfig::load(config)?.load_calibration()?;
            match table.nearest(&Pixel::new(u, v)) {
                Some(pose) => println!("{pose}"),
                None => warn!("calibration table is empty"),
            }
        }
        Command::Classify { config, u, v } => {
            let slots = RunConfig::load(config)?.load_slots()?;
            let slot = slots.classify(&Pixel::new(u, v));
            println!("{} {}", slot.name, slot.pose);
        }
        Command::Import {
            table,
            slots,
            store,
        } => {
            let db = CalibrationStore::open(&store)?;
            let table = CalibrationTable::load_json(table)?;
            db.save_table(&table)?;
            if let Some(slots) = slots {
                db.save_slots(&SlotSet::load_json(slots)?)?;
            }
            info!(store = %store.display(), entries = table.len(), "calibration imported");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sortbot_core=info,sortbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli.command).await {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
