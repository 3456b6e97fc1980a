//! `vti` command line front end.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use vti_daq::analyser::{AnalyserController, ImpedanceAnalyser, SweepRequest, SweepStatus};
use vti_daq::config::{AnalyserKind, Settings, StageKind, DEFAULT_CONFIG_FILE};
use vti_daq::error::AppResult;
use vti_daq::estimate::estimate;
use vti_daq::events::{CancelFlag, StatusEvent, StatusKind, StatusSink};
use vti_daq::planner::{frequency_list, validate_sweep};
use vti_daq::hardware::{SimulatedAnalyser, SimulatedStage};
use vti_daq::logging::{self, LogFormat};
use vti_daq::stage::TemperatureStage;
use vti_daq::telemetry::{format_hms, SweepHeader, TelemetryRecorder};
use vti_daq::{
    Direction, ExperimentContext, ExperimentController, ExperimentOutcome, Ramp, VtiError,
};

/// Variable-temperature impedance spectroscopy runner
#[derive(Parser)]
#[command(name = "vti")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured ramps
    Run {
        /// Experiment name; `_1`, `_2`, ... is appended if it already exists
        #[arg(short, long)]
        name: String,

        /// Free-text notes stored in details.json
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Show set-points, sweep sizes and the time estimate without touching hardware
    Plan,

    /// Run one impedance sweep on the configured analyser, without ramping the stage
    Sweep {
        /// Amplitude (mV)
        #[arg(long)]
        voltage: f64,

        /// Lowest frequency (Hz)
        #[arg(long)]
        fmin: f64,

        /// Highest frequency (Hz)
        #[arg(long)]
        fmax: f64,

        /// Points per decade
        #[arg(long, default_value_t = 10)]
        ppd: u32,

        /// Directory name under the experiments directory
        #[arg(short, long, default_value = "analyser_test")]
        name: String,
    },

    /// Write a starter settings file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return init(&cli.config, force);
    }

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(&settings.application.log_level, format);

    match cli.command {
        Commands::Run { name, notes } => run(&settings, &name, &notes).await,
        Commands::Plan => plan(&settings),
        Commands::Sweep {
            voltage,
            fmin,
            fmax,
            ppd,
            name,
        } => sweep(&settings, voltage, fmin, fmax, ppd, &name).await,
        Commands::Init { .. } => Ok(()),
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, use --force to overwrite", path.display());
    }
    let text = toml::to_string_pretty(&Settings::example()).context("serializing settings")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn plan(settings: &Settings) -> Result<()> {
    let ramps = settings.ramps()?;
    if ramps.is_empty() {
        println!("No ramps configured");
        return Ok(());
    }

    for ramp in &ramps {
        let points: Vec<String> = ramp
            .temperature_points()
            .iter()
            .map(|t| t.to_string())
            .collect();
        println!(
            "Ramp {} ({}, {} °C/min): [{}] °C, {} frequencies, {} sweep(s) per point",
            ramp.index(),
            ramp.direction(),
            ramp.rate(),
            points.join(", "),
            ramp.frequency_list().len(),
            ramp.num_sweeps(),
        );
    }

    let model = duration_model(settings.hardware.analyser);
    let estimate = estimate(&ramps, model.as_ref());
    println!("Estimated time: {}", format_hms(estimate.total));
    for warning in &estimate.warnings {
        println!("Warning: {}", warning);
    }
    Ok(())
}

fn duration_model(kind: AnalyserKind) -> Box<dyn vti_daq::estimate::SweepDurationModel> {
    match kind {
        AnalyserKind::Virtual => SimulatedAnalyser::new().duration_model(),
        AnalyserKind::Solartron1260 => Box::new(vti_daq::estimate::SolartronModel),
        AnalyserKind::Sp200 => Box::new(vti_daq::estimate::Sp200Model),
    }
}

async fn run(settings: &Settings, name: &str, notes: &str) -> Result<()> {
    let ramps: Vec<Ramp> = settings.ramps()?;
    let stage = connect_stage(settings.hardware.stage);
    let analyser = connect_analyser(settings).await?;
    let recorder = TelemetryRecorder::create(&settings.application.experiments_dir, name)?;

    let context = ExperimentContext {
        stage,
        analyser,
        recorder,
        timing: settings.timing.to_experiment_timing(),
    };
    let handle = ExperimentController::new(context, ramps, notes)?.start()?;
    info!(dir = %handle.dir().display(), "Writing to experiment directory");

    let cancel = handle.cancel_flag();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping at the next poll");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
        }
    });

    match handle.join().await? {
        ExperimentOutcome::Completed { elapsed } => {
            println!("Experiment complete in {}", format_hms(elapsed))
        }
        ExperimentOutcome::Cancelled { elapsed } => {
            println!("Experiment stopped after {}", format_hms(elapsed))
        }
    }
    Ok(())
}

/// Prints sweep progress to the terminal.
struct ConsoleSink;

impl StatusSink for ConsoleSink {
    fn emit(&self, event: StatusEvent) -> AppResult<()> {
        match event.kind {
            StatusKind::Scan {
                index,
                total,
                frequency,
            } => println!("{:.2e} Hz    {} / {}", frequency, index + 1, total),
            StatusKind::Warning | StatusKind::Error => println!("{}", event.message),
            _ => {}
        }
        Ok(())
    }
}

async fn sweep(
    settings: &Settings,
    voltage: f64,
    fmin: f64,
    fmax: f64,
    ppd: u32,
    name: &str,
) -> Result<()> {
    let analyser = connect_analyser(settings).await?;
    println!("Detected analyser: {}", analyser.name());
    validate_sweep(voltage, fmin, fmax, &analyser.limits())?;
    let frequencies = frequency_list(fmin, fmax, ppd).map_err(VtiError::from)?;

    let stage = connect_stage(settings.hardware.stage);
    let cell_temperature = stage
        .read_temperature()
        .await
        .context("reading cell temperature")?;

    let recorder = TelemetryRecorder::create(&settings.application.experiments_dir, name)?;
    let writer = recorder.create_sweep_file(
        recorder.dir(),
        &SweepHeader {
            sweep_number: 1,
            cell_temperature,
            set_point: cell_temperature,
            direction: Direction::Up,
        },
    )?;
    let path = writer.path().to_path_buf();

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current frequency");
            on_interrupt.cancel();
        }
    });

    println!("Performing sweep of {} frequencies...", frequencies.len());
    let task = AnalyserController::new(analyser, Arc::new(ConsoleSink), cancel).spawn(
        SweepRequest {
            voltage,
            frequencies,
            cell_temperature,
            direction: Direction::Up,
        },
        writer,
    );
    match task.join().await? {
        SweepStatus::Completed(results) => {
            println!("{} points written to {}", results.len(), path.display())
        }
        SweepStatus::Cancelled(results) => println!(
            "Sweep stopped, {} points written to {}",
            results.len(),
            path.display()
        ),
    }
    Ok(())
}

fn connect_stage(kind: StageKind) -> Arc<dyn TemperatureStage> {
    match kind {
        StageKind::Virtual => Arc::new(SimulatedStage::new()),
    }
}

async fn connect_analyser(settings: &Settings) -> Result<Arc<dyn ImpedanceAnalyser>> {
    match settings.hardware.analyser {
        AnalyserKind::Virtual => Ok(Arc::new(
            SimulatedAnalyser::new().with_noise(rand::random(), 0.01),
        )),
        AnalyserKind::Solartron1260 => connect_solartron(settings).await,
        AnalyserKind::Sp200 => Err(VtiError::fault(
            "Biologic SP-200 needs an EC-Lab channel binding, none is available on this platform",
        )
        .into()),
    }
}

#[cfg(feature = "instrument_visa")]
async fn connect_solartron(settings: &Settings) -> Result<Arc<dyn ImpedanceAnalyser>> {
    use std::time::Duration;
    use vti_daq::hardware::adapter::VisaAdapter;
    use vti_daq::hardware::{Solartron1260, SolartronOptions};

    let config = &settings.solartron;
    let adapter = VisaAdapter::open(
        &config.resource,
        "\r\n",
        Duration::from_millis(config.timeout_ms),
    )
    .await?;
    let options = SolartronOptions {
        dc_bias: config.dc_bias,
        integration_time: config.integration_time,
        ..SolartronOptions::default()
    };
    Ok(Arc::new(
        Solartron1260::connect(Box::new(adapter), options).await?,
    ))
}

#[cfg(not(feature = "instrument_visa"))]
async fn connect_solartron(_settings: &Settings) -> Result<Arc<dyn ImpedanceAnalyser>> {
    Err(VtiError::FeatureNotEnabled("instrument_visa".to_string()).into())
}
