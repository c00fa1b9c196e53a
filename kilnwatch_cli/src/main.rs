mod sink;

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use std::{fs, path::PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use eyre::WrapErr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kilnwatch_config::Config;
use kilnwatch_core::error::Result as CoreResult;
use kilnwatch_core::{EnabledZones, FsmCfg, FsmWorker};
use kilnwatch_sim::{demo_profiles, SimulatedLine};
use kilnwatch_traits::{ManualClock, MonotonicClock, SampleSource, Zone};

use crate::sink::JsonlSink;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

fn humanize(err: &eyre::Report) -> String {
    use kilnwatch_core::BuildError;

    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingSource => {
                "What happened: No sample source was provided to the worker.\nLikely causes: The poller or simulator failed to initialize.\nHow to fix: Ensure a SampleSource is wired in via with_source(...).".to_string()
            }
            BuildError::MissingSink => {
                "What happened: No state sink was provided to the worker.\nLikely causes: The persistence backend failed to initialize.\nHow to fix: Ensure a StateSink is wired in via with_sink(...).".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun. See README for a sample."
            ),
        };
    }

    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("invalid configuration") {
        return "What happened: Configuration is invalid or incomplete.\nLikely causes: Missing [line] id or out-of-range [fsm] thresholds.\nHow to fix: Edit the TOML config and try again.".to_string();
    }

    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Wire up tracing once for the process: pretty or JSON console, plus an
/// optional rolling file layer when `[logging] file` is set. The file side
/// always writes JSON lines so the log greps the same way as the sink's
/// `events.jsonl`/`runs.jsonl`; the non-blocking writer's guard is parked
/// in `LOG_GUARD` for the lifetime of the process. `RUST_LOG` overrides
/// the CLI level when present.
fn init_tracing(console_json: bool, level: &str, log: &kilnwatch_config::Logging) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let jsonl_writer = log.file.as_deref().map(|path| {
        if let Some(dir) = std::path::Path::new(path).parent() {
            let _ = fs::create_dir_all(dir);
        }
        let rotation = log
            .rotation
            .as_deref()
            .map(str::to_ascii_lowercase);
        let appender = match rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(".", path),
            Some("hourly") => tracing_appender::rolling::hourly(".", path),
            _ => tracing_appender::rolling::never(".", path),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        writer
    });

    let registry = tracing_subscriber::registry().with(filter);
    match (console_json, jsonl_writer) {
        (true, Some(w)) => registry
            .with(fmt::layer().json().with_target(false))
            .with(fmt::layer().json().with_ansi(false).with_target(false).with_writer(w))
            .init(),
        (true, None) => registry.with(fmt::layer().json().with_target(false)).init(),
        (false, Some(w)) => registry
            .with(fmt::layer().pretty().with_target(false))
            .with(fmt::layer().json().with_ansi(false).with_target(false).with_writer(w))
            .init(),
        (false, None) => registry.with(fmt::layer().pretty().with_target(false)).init(),
    }
}

#[derive(Parser, Debug)]
#[command(name = "kilnwatch", version, about = "Heating-cycle monitor CLI")]
struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/kilnwatch.toml")]
    config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Log level: trace,debug,info,warn,error
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Monitor the simulated demo line and write records as JSON lines
    Watch {
        /// Ticks to replay against the accelerated demo line (0 = none)
        #[arg(long, value_name = "N", default_value_t = 750)]
        ticks: u64,
        /// Run in real time against the wall clock instead of replaying
        #[arg(long, action = ArgAction::SetTrue)]
        realtime: bool,
        /// Seconds to run when --realtime is set
        #[arg(long, value_name = "S", default_value_t = 30)]
        duration_s: u64,
        /// Directory for state, events, and run records
        #[arg(long, value_name = "DIR", default_value = "var/kilnwatch")]
        out_dir: PathBuf,
    },
    /// Quick health check (simulated line reachable)
    SelfCheck,
}

fn main() -> eyre::Result<()> {
    if let Err(e) = real_main() {
        eprintln!("{}", humanize(&e));
        std::process::exit(2);
    }
    Ok(())
}

fn fsm_cfg_from(cfg: &Config) -> FsmCfg {
    FsmCfg {
        version: cfg.fsm.version,
        zones: EnabledZones {
            preheat: cfg.zones.preheat,
            main: cfg.zones.main,
            rib: cfg.zones.rib,
        },
        sampling_period_s: cfg.fsm.sampling_period_s,
        tol_f: cfg.fsm.tol_f,
        delta_ramp_f: cfg.fsm.delta_ramp_f,
        dt_min_f_per_min: cfg.fsm.dt_min_f_per_min,
        t_stable_s: cfg.fsm.t_stable_s,
        delta_off_f: cfg.fsm.delta_off_f,
        t_off_sustain_s: cfg.fsm.t_off_sustain_s,
        s_min_f: cfg.fsm.s_min_f,
        t_sp_sustain_s: cfg.fsm.t_sp_sustain_s,
        max_ramp_s: cfg.fsm.max_ramp_s,
        max_stage_s: cfg.fsm.max_stage_s,
        quiet_window_s: cfg.fsm.quiet_window_s,
        dt_quiet_f_per_min: cfg.fsm.dt_quiet_f_per_min,
        allow_main_without_preheat: cfg.fsm.allow_main_without_preheat,
        continue_after_fault_if_next_stage_ramps: cfg.fsm.continue_after_fault_if_next_stage_ramps,
    }
}

fn real_main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let cfg_text = fs::read_to_string(&cli.config)
        .wrap_err_with(|| format!("read config {:?}", cli.config))?;
    let cfg: Config =
        toml::from_str(&cfg_text).wrap_err_with(|| format!("parse config {:?}", cli.config))?;
    cfg.validate().wrap_err("invalid configuration")?;

    init_tracing(cli.json, &cli.log_level, &cfg.logging);

    match cli.cmd {
        Commands::SelfCheck => self_check(&cfg),
        Commands::Watch {
            ticks,
            realtime,
            duration_s,
            out_dir,
        } => {
            if realtime {
                watch_realtime(&cfg, duration_s, &out_dir)
            } else {
                watch_replay(&cfg, ticks, &out_dir)
            }
        }
    }
}

fn self_check(cfg: &Config) -> CoreResult<()> {
    tracing::info!("self-check starting");
    let clock = Arc::new(MonotonicClock::new());
    let line = SimulatedLine::new(clock, demo_profiles(75.0));
    for zone in Zone::ALL {
        match line.get_latest(zone) {
            Ok(Some(s)) => tracing::info!(zone = %zone, temp_f = s.temperature_f, "zone readable"),
            Ok(None) => return Err(eyre::eyre!("zone {zone} not simulated")),
            Err(e) => return Err(eyre::eyre!("zone {zone} read failed: {e}")),
        }
    }
    fsm_cfg_from(cfg).validate()?;
    tracing::info!("self-check ok");
    println!("OK");
    Ok(())
}

/// Replay the demo line as fast as the FSM can consume it, one simulated
/// tick at a time on a manual clock.
fn watch_replay(cfg: &Config, ticks: u64, out_dir: &PathBuf) -> CoreResult<()> {
    let fsm_cfg = fsm_cfg_from(cfg);
    let period = Duration::from_millis(fsm_cfg.period_ms());

    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let source = Arc::new(SimulatedLine::new(clock.clone(), demo_profiles(75.0)));
    let sink = JsonlSink::new(out_dir).wrap_err("open state directory")?;

    let mut worker = FsmWorker::builder(cfg.line.id.clone(), fsm_cfg)
        .with_source(source)
        .with_sink(Box::new(sink))
        .with_clock(clock.clone())
        .try_build()?;

    tracing::info!(line_id = %cfg.line.id, ticks, "replay watch start");
    for _ in 0..ticks {
        clock.advance(period);
        worker.tick();
    }
    let status = worker.status();
    println!(
        "processed {} samples over {} ticks ({} events)",
        status.samples_processed, status.ticks, status.events_generated
    );
    print_runs(out_dir);
    Ok(())
}

fn watch_realtime(cfg: &Config, duration_s: u64, out_dir: &PathBuf) -> CoreResult<()> {
    let fsm_cfg = fsm_cfg_from(cfg);
    let clock = Arc::new(MonotonicClock::new());
    let source = Arc::new(SimulatedLine::new(clock.clone(), demo_profiles(75.0)));
    let sink = JsonlSink::new(out_dir).wrap_err("open state directory")?;

    let worker = FsmWorker::builder(cfg.line.id.clone(), fsm_cfg)
        .with_source(source)
        .with_sink(Box::new(sink))
        .with_clock(clock)
        .try_build()?;

    tracing::info!(line_id = %cfg.line.id, duration_s, "realtime watch start");
    let handle = worker.spawn();
    std::thread::sleep(Duration::from_secs(duration_s));
    if let Some(status) = handle.status() {
        println!(
            "processed {} samples over {} ticks ({} events)",
            status.samples_processed, status.ticks, status.events_generated
        );
    }
    handle.stop()?;
    print_runs(out_dir);
    Ok(())
}

fn print_runs(out_dir: &PathBuf) {
    let Ok(text) = fs::read_to_string(out_dir.join("runs.jsonl")) else {
        println!("runs closed: 0");
        return;
    };
    let mut n = 0;
    for line in text.lines() {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            n += 1;
            println!(
                "run {} closed: {} (partial: {})",
                v["run_id"].as_str().unwrap_or("?"),
                v["termination"].as_str().unwrap_or("?"),
                v["partial"]
            );
        }
    }
    println!("runs closed: {n}");
}
