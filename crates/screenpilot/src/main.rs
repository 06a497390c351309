//! sp: command-line front end for screenpilot.
//!
//! Thin wrapper over `screenpilot-core`: device plumbing through ADB, config
//! inspection, stats reports, and an offline dry run of the navigator.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use screenpilot_core::adb::AdbTransport;
use screenpilot_core::cancel::CancellationToken;
use screenpilot_core::config::{Config, LogFormat};
use screenpilot_core::device::{DeviceId, DeviceRegistry};
use screenpilot_core::error::{ConfigError, NavigationError, Remediation, TransportError};
use screenpilot_core::logging::{LogConfig, init_logging};
use screenpilot_core::navigator::Navigator;
use screenpilot_core::routes::RouteTable;
use screenpilot_core::screen::Screen;
use screenpilot_core::stats::{BudgetPolicy, SessionRecord, StatsTracker, load_sessions};
use screenpilot_core::testing::{Action, FakeGame};
use screenpilot_core::vision::{DeviceTransport, KeyCode, Point};

#[derive(Parser, Debug)]
#[command(
    name = "sp",
    version,
    about = "Drive emulator devices through the screenpilot control loop"
)]
struct Cli {
    /// Config file (overrides $SCREENPILOT_CONFIG and the search path)
    #[arg(long, global = true, env = "SCREENPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List ready devices
    Devices {
        /// Print JSON instead of one id per line
        #[arg(long)]
        json: bool,
    },
    /// Tap a coordinate
    Tap { device: String, x: u32, y: u32 },
    /// Send an Android key code (4 = BACK)
    Key { device: String, code: u32 },
    /// Save a PNG screenshot
    Screenshot { device: String, out: PathBuf },
    /// Report persisted session statistics
    Stats(StatsArgs),
    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the built-in route table
    Routes {
        #[arg(long)]
        json: bool,
    },
    /// Navigate between screens in a simulated game, printing the inputs sent
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// Print the merged record as JSON
    #[arg(long)]
    json: bool,
    /// Session directory (defaults to the configured stats dir)
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Validate the effective configuration
    Check,
    /// Print the effective configuration as TOML
    Show,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Starting screen
    #[arg(long, default_value = "MAP")]
    from: Screen,
    /// Target screen
    #[arg(long)]
    to: Screen,
    /// Delay between an input and the screen change (ms)
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
}

#[derive(Serialize)]
struct RouteRow {
    from: Screen,
    to: Screen,
    waypoints: Vec<Screen>,
}

#[derive(Serialize)]
struct EdgeRow {
    from: Screen,
    to: Screen,
    transition: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = remediation_for(&err) {
                eprintln!();
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

/// Remediation for whichever core error sits at the root of `err`.
fn remediation_for(err: &anyhow::Error) -> Option<Remediation> {
    if let Some(err) = err.downcast_ref::<screenpilot_core::Error>() {
        return err.remediation();
    }
    if let Some(err) = err.downcast_ref::<TransportError>() {
        return Some(err.remediation());
    }
    if let Some(err) = err.downcast_ref::<ConfigError>() {
        return Some(err.remediation());
    }
    err.downcast_ref::<NavigationError>()
        .map(NavigationError::remediation)
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let mut log = LogConfig::from(&config.general);
    if let Some(level) = cli.log_level.clone() {
        log.level = level;
    }
    if let Some(format) = cli.log_format {
        log.format = format;
    }
    init_logging(&log).context("initializing logging")?;
    debug!(command = ?cli.command, "Starting");

    match cli.command {
        Commands::Devices { json } => devices(&config, json),
        Commands::Tap { device, x, y } => {
            adb(&config).tap(&DeviceId::new(device), Point::new(x, y))?;
            Ok(())
        }
        Commands::Key { device, code } => {
            adb(&config).key_event(&DeviceId::new(device), KeyCode(code))?;
            Ok(())
        }
        Commands::Screenshot { device, out } => {
            let png = adb(&config).capture_png(&DeviceId::new(device))?;
            std::fs::write(&out, &png)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("{} ({} bytes)", out.display(), png.len());
            Ok(())
        }
        Commands::Stats(args) => stats(&config, &args),
        Commands::Config(ConfigCommand::Check) => {
            config.validate()?;
            println!("Config OK");
            Ok(())
        }
        Commands::Config(ConfigCommand::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Routes { json } => routes(json),
        Commands::Simulate(args) => simulate(&config, &args),
    }
}

fn adb(config: &Config) -> AdbTransport {
    AdbTransport::from_config(&config.adb)
}

fn devices(config: &Config, json: bool) -> Result<()> {
    let devices = adb(config).list_devices()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No devices ready");
    } else {
        for device in devices {
            println!("{device}");
        }
    }
    Ok(())
}

fn stats(config: &Config, args: &StatsArgs) -> Result<()> {
    let dir = args.dir.clone().unwrap_or_else(|| config.stats_dir());
    let sessions = load_sessions(&dir);
    let Some((_, first)) = sessions.first() else {
        if args.json {
            println!("null");
        } else {
            println!("No sessions in {}", dir.display());
        }
        return Ok(());
    };

    let mut merged: SessionRecord = first.clone();
    for (_, record) in sessions.iter().skip(1) {
        merged.merge(record);
    }
    info!(dir = %dir.display(), sessions = sessions.len(), "Loaded stats sessions");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&merged)?);
    } else {
        println!("{} session(s) in {}", sessions.len(), dir.display());
        print!("{}", merged.summary());
    }
    Ok(())
}

fn routes(json: bool) -> Result<()> {
    let table = RouteTable::default();
    if json {
        let edges: Vec<EdgeRow> = table
            .edges()
            .into_iter()
            .map(|(from, to, transition)| EdgeRow {
                from,
                to,
                transition: transition.to_string(),
            })
            .collect();
        let routes: Vec<RouteRow> = table
            .routes()
            .into_iter()
            .map(|(from, to, waypoints)| RouteRow {
                from,
                to,
                waypoints: waypoints.to_vec(),
            })
            .collect();
        let doc = serde_json::json!({ "edges": edges, "routes": routes });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Edges:");
    for (from, to, transition) in table.edges() {
        println!("  {from} -> {to}: {transition}");
    }
    println!("Routes:");
    for (from, to, waypoints) in table.routes() {
        let path: Vec<&str> = waypoints.iter().map(|s| s.as_str()).collect();
        println!("  {from} -> {to}: {}", path.join(" > "));
    }
    Ok(())
}

fn simulate(config: &Config, args: &SimulateArgs) -> Result<()> {
    if !args.from.is_known() || !args.to.is_known() {
        bail!("simulate needs known screens, got {} -> {}", args.from, args.to);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("building runtime")?;

    let game = FakeGame::standard();
    game.set_latency(Duration::from_millis(args.latency_ms));
    let device = DeviceId::new("sim");
    game.place(&device, args.from.as_str());

    let stats = Arc::new(StatsTracker::in_memory(
        &config.stats,
        BudgetPolicy::from(&config.timing),
    ));
    let navigator = Navigator::assemble(
        game.vision(),
        Arc::new(DeviceRegistry::new()),
        stats,
        RouteTable::default(),
        config,
    );

    let result = runtime.block_on(navigator.navigate(&device, args.to, &CancellationToken::new()));
    for action in game.actions(&device) {
        println!("{}", describe(action));
    }
    result?;
    println!("Arrived at {}", args.to);
    Ok(())
}

fn describe(action: Action) -> String {
    match action {
        Action::Tap(p) => format!("tap {} {}", p.x, p.y),
        Action::Key(code) => format!("key {}", code.0),
        Action::Swipe(a, b) => format!("swipe {} {} {} {}", a.x, a.y, b.x, b.y),
    }
}
