//! Headless command-line entry point for the pick-and-plate stack.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pickplate::cycle::{CycleEvent, CycleOrchestrator, OperatorDecision, OperatorPrompt};
use pickplate::link::{SerialLink, SerialTransport};
use pickplate::motion::MotionController;
use pickplate::protocol::Precision;
use pickplate::vision::NullVision;
use pickplate::{EmbryoProfile, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pickplate", about = "Embryo pick-and-plate machine control")]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port override (e.g. /dev/ttyUSB1).
    #[arg(long, global = true)]
    port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full autonomous pick-and-plate cycle.
    Run {
        /// Embryo preparation profile override.
        #[arg(long)]
        profile: Option<ProfileArg>,
    },
    /// Home the stage and exit.
    Home {
        #[arg(long, default_value = "fine")]
        precision: PrecisionArg,
    },
    /// Set the ring light brightness (0..=1000) and exit.
    Light { brightness: i32 },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProfileArg {
    Chorionated,
    Dechorionated,
}

impl From<ProfileArg> for EmbryoProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Chorionated => EmbryoProfile::Chorionated,
            ProfileArg::Dechorionated => EmbryoProfile::Dechorionated,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PrecisionArg {
    Rough,
    Fine,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::Rough => Precision::Rough,
            PrecisionArg::Fine => Precision::Fine,
        }
    }
}

/// Operator prompts answered on the terminal.
struct ConsoleOperator;

impl ConsoleOperator {
    async fn read_line() -> String {
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        let _ = reader.read_line(&mut line).await;
        line
    }
}

#[async_trait::async_trait]
impl OperatorPrompt for ConsoleOperator {
    async fn confirm_embryos_loaded(&self) -> OperatorDecision {
        println!("Load embryos into the dish, then press Enter (or type 'exit'):");
        let line = Self::read_line().await;
        if line.trim().eq_ignore_ascii_case("exit") {
            OperatorDecision::Exit
        } else {
            OperatorDecision::Continue
        }
    }

    async fn no_embryos_found(&self) -> OperatorDecision {
        println!("No pickable embryos found. Reload the dish and press Enter, or type 'exit':");
        let line = Self::read_line().await;
        if line.trim().eq_ignore_ascii_case("exit") {
            OperatorDecision::Exit
        } else {
            OperatorDecision::Continue
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings =
        Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(port) = cli.port {
        settings.serial.port = port;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = Box::new(SerialTransport::new(
        settings.serial.port.clone(),
        settings.serial.baud,
    ));
    let (link, link_task) = SerialLink::spawn(transport, shutdown_rx.clone());
    let (motion, motion_task) = MotionController::spawn(link, &settings, shutdown_rx.clone());

    match cli.command {
        Command::Run { profile } => {
            if let Some(profile) = profile {
                settings.system.profile = profile.into();
            }
            info!(
                profile = settings.system.profile.name(),
                port = %settings.serial.port,
                "Starting pick-and-plate cycle"
            );

            let (cycle, cycle_task) = CycleOrchestrator::spawn(
                motion,
                Arc::new(NullVision),
                Arc::new(ConsoleOperator),
                settings,
                shutdown_rx,
            );
            let mut events = cycle.subscribe();
            cycle.start();

            let mut stop_requested = false;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        if stop_requested {
                            warn!("Second interrupt, shutting down immediately");
                            break;
                        }
                        info!("Interrupt received, finishing the current pick");
                        cycle.stop();
                        stop_requested = true;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(CycleEvent::PickCompleted { well, wells_filled, .. }) => {
                                info!(%well, wells_filled, "Pick completed");
                            }
                            Ok(CycleEvent::RunFinished { wells_filled, elapsed }) => {
                                info!(
                                    wells_filled,
                                    elapsed_s = elapsed.as_secs_f64(),
                                    "Run finished"
                                );
                                break;
                            }
                            Ok(CycleEvent::StateChanged(_)) => {}
                            Err(e) => {
                                error!("Cycle event stream ended: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            drop(events);
            let _ = shutdown_tx.send(true);
            join_with_timeout(cycle_task, "cycle").await;
        }
        Command::Home { precision } => {
            motion.home_full(precision.into()).await?;
            info!("Homing complete");
            let _ = shutdown_tx.send(true);
        }
        Command::Light { brightness } => {
            motion.set_light(brightness).await?;
            info!(brightness, "Light set");
            let _ = shutdown_tx.send(true);
        }
    }

    join_with_timeout(motion_task, "motion").await;
    join_with_timeout(link_task, "link").await;
    Ok(())
}

async fn join_with_timeout(task: tokio::task::JoinHandle<()>, name: &str) {
    if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
        warn!("The {name} worker did not shut down in time");
    }
}
