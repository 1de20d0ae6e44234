use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use clap::Parser;
use log::info;

use wxstation::{
    init_logging_with, Accumulators, CancelToken, DaySummary, DeviceFamily, Field, HostClock,
    RecordSink, Sample, Session, SessionState, StationConfig, SystemClock, TransportConfig,
};

#[derive(Parser, Debug)]
#[command(name = "wxstation", about = "Backfill and poll a weather station console")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Device family (gateway, nibble, hid, stream), overrides the configuration
    #[arg(short, long)]
    family: Option<String>,
    /// Serial device path, e.g. /dev/ttyUSB0
    #[arg(long)]
    port: Option<String>,
    /// Gateway address as host or host:port
    #[arg(long)]
    host: Option<String>,
    /// Session state file, read at start and written on exit
    #[arg(long)]
    state: Option<PathBuf>,
    /// Read the history and exit without live polling
    #[arg(long)]
    backfill_only: bool,
    /// Stop live polling after this many seconds
    #[arg(long)]
    duration: Option<u64>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

/// Prints one line per record.
struct StdoutSink;

impl RecordSink for StdoutSink {
    fn record(&mut self, sample: &Sample, totals: &Accumulators) -> wxstation::Result<()> {
        let readings: Vec<String> = Field::all()
            .filter_map(|f| sample.get(f).map(|v| format!("{}={:.1}", f.name(), v)))
            .collect();
        println!(
            "{} {} rain_today={:.1} wind_run={:.1}",
            sample.timestamp.format("%Y-%m-%d %H:%M:%S"),
            readings.join(" "),
            totals.rain_today_mm,
            totals.wind_run_km
        );
        Ok(())
    }

    fn day_closed(&mut self, summary: &DaySummary) -> wxstation::Result<()> {
        println!(
            "day {} closed: rain={:.1}mm wind_run={:.1}km hdd={:.2} cdd={:.2}",
            summary.date,
            summary.rain_mm,
            summary.wind_run_km,
            summary.heating_degree_days,
            summary.cooling_degree_days
        );
        Ok(())
    }

    fn midnight_reset(&mut self, date: NaiveDate) -> wxstation::Result<()> {
        println!("midnight {date}");
        Ok(())
    }

    fn data_stopped(&mut self, since: NaiveDateTime) {
        eprintln!("Data stopped since {since}");
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn load_config(args: &Args) -> Result<StationConfig> {
    let mut config = match &args.config {
        Some(path) => StationConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => StationConfig::default(),
    };

    if let Some(family) = &args.family {
        config.family = family.parse::<DeviceFamily>()?;
    }
    if let Some(port) = &args.port {
        match config.transport() {
            TransportConfig::Serial {
                baud_rate, dtr, rts, ..
            } => {
                config.transport = Some(TransportConfig::Serial {
                    port: port.clone(),
                    baud_rate,
                    dtr,
                    rts,
                })
            }
            other => bail!("--port needs a serial transport, configured: {other:?}"),
        }
    }
    if let Some(host) = &args.host {
        let (host, port) = match host.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .with_context(|| format!("invalid gateway port {port}"))?,
            ),
            None => (host.clone(), 45000),
        };
        config.transport = Some(TransportConfig::Tcp { host, port });
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_state(path: &Path) -> Result<Option<SessionState>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading state {}", path.display()))?;
    let state = toml::from_str(&text).with_context(|| format!("parsing state {}", path.display()))?;
    Ok(Some(state))
}

fn save_state(path: &Path, state: &SessionState) -> Result<()> {
    let text = toml::to_string(state).context("serialising session state")?;
    std::fs::write(path, text).with_context(|| format!("writing state {}", path.display()))?;
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging_with(args.log_level.as_deref());

    let config = load_config(&args)?;
    let state = match &args.state {
        Some(path) => load_state(path)?,
        None => None,
    };
    println!("--- {} station on {:?} ---", config.family.name(), config.transport());

    let clock: Arc<dyn HostClock> = Arc::new(SystemClock);
    let until = args
        .duration
        .map(|secs| clock.now() + TimeDelta::seconds(secs as i64));
    let mut session = Session::open(
        config,
        Box::new(StdoutSink),
        state,
        Arc::clone(&clock),
        CancelToken::new(),
    )
    .context("opening station")?;

    if args.backfill_only {
        session.start()?;
        session.synchronize_clock();
        let report = session.backfill()?;
        println!(
            "Backfill: read={} applied={} skipped={} day_closes={}",
            report.read, report.applied, report.skipped, report.day_closes
        );
    } else {
        session.run(until)?;
    }

    let state = session.stop();
    if let Some(path) = &args.state {
        save_state(path, &state)?;
        info!("session state saved: {}", path.display());
    }
    println!("Done.");
    Ok(())
}
