use clap::{Parser, Subcommand};
use colored::Colorize;
use harness::{
    collect, discover, emit, load_suites, HarnessConfig, LogLevel, LogScanner, Orchestrator,
    OutputFormat,
};
use probe::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harness")]
#[command(about = "Runs declarative test suites against the Hydrogen server")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run suites and report pass/fail per subtest
    Run {
        /// Harness configuration file
        #[arg(short, long, default_value = "harness.toml")]
        config: PathBuf,
        /// Glob selecting suite files (overrides run.suites)
        #[arg(short, long)]
        suites: Option<String>,
        /// Suites run at once (overrides run.jobs)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Only run suites whose name contains this
        #[arg(long)]
        filter: Option<String>,
        /// Where logs, result files and the summary go
        #[arg(long)]
        results_dir: Option<PathBuf>,
        /// Keep per-task result files
        #[arg(long)]
        keep_results: bool,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List discovered suites
    List {
        #[arg(short, long, default_value = "harness.toml")]
        config: PathBuf,
        #[arg(short, long)]
        suites: Option<String>,
    },
    /// Inspect a subject log file
    ScanLog {
        file: PathBuf,
        /// Show dependency check lines
        #[arg(long)]
        deps: bool,
        /// Only entries at this level or above
        #[arg(long)]
        level: Option<LogLevel>,
        /// Regex to match against raw lines
        #[arg(long)]
        grep: Option<String>,
    },
    /// Probe a running server once
    Probe {
        base_url: String,
        /// Request path (defaults to the health endpoint)
        #[arg(long)]
        path: Option<String>,
        /// Use a WebSocket handshake instead of HTTP
        #[arg(long)]
        websocket: bool,
        #[arg(long, default_value = "hydrogen")]
        protocol: String,
        /// WebSocket key, sent as `Authorization: Key <key>`
        #[arg(long, env = "WEBSOCKET_KEY")]
        key: Option<String>,
        /// Text frame for WebSocket, JSON body (sent as POST) for HTTP
        #[arg(long)]
        message: Option<String>,
    },
    /// Print result files
    Results {
        dir: PathBuf,
        #[arg(long, default_value = "task")]
        stem: String,
    },
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "harness=debug,probe=debug"
    } else {
        "harness=info,probe=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A missing default config file means built-in defaults.
fn load_config(path: &Path) -> Result<HarnessConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(HarnessConfig::load(path)?)
    } else {
        info!("{} not found, using defaults", path.display());
        Ok(HarnessConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if std::env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    }

    match cli.command {
        Commands::Run {
            config,
            suites,
            jobs,
            filter,
            results_dir,
            keep_results,
            format,
        } => {
            let mut config = load_config(&config)?;
            if let Some(pattern) = suites {
                config = config.with_suites(pattern);
            }
            if let Some(jobs) = jobs {
                config = config.with_jobs(jobs);
            }
            if let Some(dir) = results_dir {
                config = config.with_results_dir(dir);
            }
            config.run.keep_results |= keep_results;
            config.validate()?;

            let code = run_suites(config, filter, format).await?;
            std::process::exit(code);
        }
        Commands::List { config, suites } => {
            let mut config = load_config(&config)?;
            if let Some(pattern) = suites {
                config = config.with_suites(pattern);
            }
            list_suites(&config)?;
        }
        Commands::ScanLog {
            file,
            deps,
            level,
            grep,
        } => {
            scan_log(&file, deps, level, grep.as_deref())?;
        }
        Commands::Probe {
            base_url,
            path,
            websocket,
            protocol,
            key,
            message,
        } => {
            let mut config = ProbeConfig::new()
                .with_base_url(base_url)
                .with_protocol(protocol);
            if let Some(key) = key.filter(|k| !k.is_empty()) {
                config = config.with_websocket_key(key);
            }
            probe_once(config, path, websocket, message).await?;
        }
        Commands::Results { dir, stem } => {
            print_results(&dir, &stem)?;
        }
    }

    Ok(())
}

async fn run_suites(
    config: HarnessConfig,
    filter: Option<String>,
    format: OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let results_dir = config.run.results_dir.clone();
    let mut orchestrator = Orchestrator::new(config);
    if let Some(filter) = filter {
        orchestrator = orchestrator.with_filter(filter);
    }

    let summary = orchestrator.run_discovered().await?;
    if summary.reports.is_empty() {
        error!(
            "No suites matched {}",
            orchestrator.config().run.suites
        );
    }

    emit(&summary, format)?;
    let path = summary.write_json(&results_dir)?;
    info!("Summary written to {}", path.display());

    Ok(summary.exit_code())
}

fn list_suites(config: &HarnessConfig) -> Result<(), Box<dyn std::error::Error>> {
    let paths = discover(&config.run.suites)?;
    if paths.is_empty() {
        println!("No suites match {}", config.run.suites);
        return Ok(());
    }

    for (path, loaded) in load_suites(&paths) {
        match loaded {
            Ok(suite) => println!(
                "  {} ({} checks, {} tasks)  {}",
                suite.name.bold(),
                suite.checks.len(),
                suite.tasks.run.len(),
                path.display()
            ),
            Err(e) => println!("  {}  {}: {}", "BROKEN".red(), path.display(), e),
        }
    }
    Ok(())
}

fn scan_log(
    file: &Path,
    deps: bool,
    level: Option<LogLevel>,
    grep: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scanner = LogScanner::open(file);

    if deps {
        for dep in scanner.dependencies()? {
            println!(
                "{:<16} expected {:<10} found {:<10} {}",
                dep.library,
                dep.expected,
                dep.found.as_deref().unwrap_or("None"),
                dep.status
            );
        }
        return Ok(());
    }

    if let Some(pattern) = grep {
        for line in scanner.matches(pattern)? {
            println!("{}", line);
        }
        return Ok(());
    }

    let entries = match level {
        Some(level) => scanner.entries_at_least(level)?,
        None => scanner.entries()?,
    };
    for entry in entries {
        println!(
            "{:<5}  {:<12}  {}",
            entry.level.to_string(),
            entry.subsystem,
            entry.message
        );
    }
    Ok(())
}

async fn probe_once(
    config: ProbeConfig,
    path: Option<String>,
    websocket: bool,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = if websocket {
        let probe = WebSocketProbe::new(config.with_timeout(DEFAULT_HANDSHAKE_TIMEOUT))?;
        let mut request = ProbeRequest::get(path.unwrap_or_default());
        if let Some(message) = message {
            request = request.with_body(Value::String(message));
        }
        probe.exchange(request).await?
    } else {
        let probe = HttpProbe::new(config.with_timeout(Duration::from_secs(10)))?;
        let path = path.unwrap_or_else(|| HEALTH_PATH.to_string());
        let request = match message {
            Some(message) => ProbeRequest::post(path, serde_json::from_str(&message)?),
            None => ProbeRequest::get(path),
        };
        probe.exchange(request).await?
    };

    let status = if response.is_success() {
        response.status.to_string().green()
    } else {
        response.status.to_string().red()
    };
    println!("{} in {:?}", status, response.latency);
    if !response.body.is_empty() {
        println!("{}", response.body);
    }
    Ok(())
}

fn print_results(dir: &Path, stem: &str) -> Result<(), Box<dyn std::error::Error>> {
    let records = collect(dir, stem)?;
    if records.is_empty() {
        println!("No {}-*.result files in {}", stem, dir.display());
        return Ok(());
    }

    for record in records {
        println!("{}", record.path.display().to_string().bold());
        for (key, value) in &record.entries {
            println!("  {} = {}", key, value);
        }
    }
    Ok(())
}
