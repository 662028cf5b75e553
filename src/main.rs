//! apsloop simulator: runs the dosing loop against a simulated patient.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │                                                              │
//! │  SimSensor   SimPump   MemoryStore   LogEventSink  SimClock  │
//! │  (Sensor)    (Pump)    (Persistence) (Event/Audit) (Clock)   │
//! │                                                              │
//! │  ──────────────── Port Trait Boundary ──────────────────     │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │            LoopService (pure logic)                    │  │
//! │  │  FSM · Strategy · Constraint pipeline · Dispatcher     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  CycleScheduler (delegate-driven) · LoopRunner (serialized)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::{Parser, ValueEnum};
use log::{info, warn};

use apsloop::activity::log::EventLog;
use apsloop::adapters::log_sink::{LogAuditSink, LogEventSink};
use apsloop::adapters::memory_store::MemoryStore;
use apsloop::adapters::sim::{Patient, SimPump, SimSensor};
use apsloop::adapters::time::SimClock;
use apsloop::app::commands::AppCommand;
use apsloop::app::ports::{Clock, TriggerDelegate, TriggerKind};
use apsloop::app::runner::{BoundLoop, CycleTarget, LoopRunner, RunOutcome};
use apsloop::app::service::LoopService;
use apsloop::config::{EngineConfig, LoopMode, StrategyConfig};
use apsloop::profile::{Profile, ProfileSegment, ProfileStore};
use apsloop::scheduler::CycleScheduler;
use apsloop::strategy::StrategyKind;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Filter directive used when `RUST_LOG` is unset.
    fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Install the fmt subscriber on stderr. `RUST_LOG` overrides `--log-level`.
fn init_logging(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing logger: {e}"))
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Pid,
    Predictive,
    Replay,
}

#[derive(Debug, Parser)]
#[command(name = "apsloop-sim", version, about = "Run the dosing loop against a simulated patient")]
struct Cli {
    /// Simulated minutes to run.
    #[arg(long, default_value_t = 360)]
    minutes: i64,

    /// Engine configuration (JSON).  Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured strategy.
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Surface doses as suggestions instead of sending them.
    #[arg(long)]
    open_loop: bool,

    /// Starting glucose (mg/dL).
    #[arg(long, default_value_t = 160.0)]
    glucose: f64,

    /// Underlying glucose drift (mg/dL per minute).
    #[arg(long, default_value_t = 0.2)]
    drift: f64,

    /// Meal as MINUTE:GRAMS; repeatable.
    #[arg(long = "meal", value_parser = parse_meal)]
    meals: Vec<(i64, f64)>,

    /// Lose the acknowledgment of every n-th pump command.
    #[arg(long)]
    lose_ack_every: Option<u32>,

    /// Sensor stops reporting at this minute.
    #[arg(long)]
    dropout_at: Option<i64>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Include full JSON bodies in audit lines.
    #[arg(long)]
    verbose_audit: bool,
}

fn parse_meal(s: &str) -> Result<(i64, f64), String> {
    let (minute, grams) = s.split_once(':').ok_or("expected MINUTE:GRAMS")?;
    let minute = minute.trim().parse().map_err(|e| format!("minute: {e}"))?;
    let grams = grams.trim().parse().map_err(|e| format!("grams: {e}"))?;
    Ok((minute, grams))
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    match cli.strategy {
        Some(StrategyArg::Pid) => config.strategy = StrategyConfig::default(),
        Some(StrategyArg::Predictive) => {
            config.strategy = StrategyConfig::Predictive { horizon_minutes: 30 };
        }
        Some(StrategyArg::Replay) => config.strategy = StrategyConfig::ProfileReplay,
        None => {}
    }
    if cli.open_loop {
        config.loop_mode = LoopMode::Open;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn default_profile() -> Profile {
    Profile::flat(
        "simulated",
        ProfileSegment {
            start_minute: 0,
            basal_mu_per_hour: 1_000,
            isf_mg_dl_per_u: 50.0,
            carb_ratio_g_per_u: 10.0,
            target_low: 100.0,
            target_high: 120.0,
        },
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;
    info!("apsloop-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    let start = Utc
        .with_ymd_and_hms(2026, 3, 1, 6, 0, 0)
        .single()
        .context("start time")?;
    let clock = SimClock::new(start);

    let profile = default_profile();
    let patient = Arc::new(Mutex::new(Patient::new(
        cli.glucose,
        cli.drift,
        profile.segments[0].basal_mu_per_hour,
    )));

    let mut profiles = ProfileStore::new();
    profiles.publish(profile, start - Duration::days(1))?;

    let log = EventLog::open(
        MemoryStore::new(),
        start,
        Duration::hours(i64::from(config.activity_window_hours)),
    )?;
    let mut scheduler = CycleScheduler::from_config(&config);
    let strategy = StrategyKind::from_config(&config.strategy);
    let service = LoopService::new(config, strategy, profiles, log)?;
    let cancel = service.cancel_token();

    let sensor = SimSensor::new(Arc::clone(&patient), clock.clone());
    let mut pump = SimPump::new(Arc::clone(&patient));
    pump.lose_ack_every = cli.lose_ack_every;

    let bound = BoundLoop::new(
        service,
        sensor,
        pump,
        LogEventSink::new(),
        LogAuditSink::new(cli.verbose_audit),
    );
    let runner = LoopRunner::new(bound, clock.clone(), cancel);

    let mut tally: BTreeMap<String, usize> = BTreeMap::new();

    for minute in 0..cli.minutes {
        let now = clock.now();

        for &(_, grams) in cli.meals.iter().filter(|(m, _)| *m == minute) {
            patient.lock().unwrap_or_else(PoisonError::into_inner).eat(grams);
            let announced = runner.with_target(|b| {
                b.service.handle_command(
                    AppCommand::AnnounceMeal {
                        carbs_g: grams,
                        absorption_minutes: None,
                    },
                    now,
                )
            });
            match announced {
                Ok(Some(kind)) => {
                    scheduler.note_cycle(now);
                    count(&mut tally, runner.trigger(kind));
                }
                Ok(None) => {}
                Err(e) => warn!("Meal announcement failed: {e}"),
            }
        }

        if cli.dropout_at == Some(minute) {
            warn!("Simulated sensor dropout");
            runner.with_target(|b| b.sensor.dropout = true);
        }

        let newest = runner.with_target(|b| b.sensor.newest_reading_at());
        let mut delegate = Tally {
            runner: &runner,
            tally: &mut tally,
        };
        scheduler.poll(now, newest, &mut delegate);

        patient.lock().unwrap_or_else(PoisonError::into_inner).advance(1);
        clock.advance(Duration::minutes(1));
    }

    let bound = runner.into_inner();
    let final_glucose = patient.lock().unwrap_or_else(PoisonError::into_inner).glucose_mg_dl;
    info!("──────── summary ────────");
    info!("cycles: {}", bound.service.cycle_count());
    for (reason, count) in &tally {
        info!("  {count:>4} × {reason}");
    }
    info!("pump commands: {}", bound.pump.sent());
    info!("final glucose: {final_glucose:.0} mg/dL");
    info!(
        "audit: last digest {} ({} pending, {} dropped)",
        bound.service.audit().last_digest(),
        bound.service.audit().pending(),
        bound.service.audit().dropped()
    );
    if bound.service.audit().dropped() > 0 {
        bail!("audit records were dropped");
    }
    Ok(())
}

fn count(tally: &mut BTreeMap<String, usize>, outcome: RunOutcome) {
    if let RunOutcome::Ran(results) = outcome {
        for r in results {
            *tally.entry(r.reason.to_string()).or_default() += 1;
        }
    }
}

/// Scheduler delegate that runs the cycle and counts its outcome.
struct Tally<'a, T: CycleTarget, C: Clock> {
    runner: &'a LoopRunner<T, C>,
    tally: &'a mut BTreeMap<String, usize>,
}

impl<T: CycleTarget, C: Clock> TriggerDelegate for Tally<'_, T, C> {
    fn on_trigger(&mut self, kind: TriggerKind, _at: DateTime<Utc>) {
        count(self.tally, self.runner.trigger(kind));
    }
}
