//! `ck`: inspect, sweep and upload crashkeep crash records.
//!
//! ```bash
//! ck list --limit 5
//! ck show latest
//! ck --format json sweep --max-age-days 3
//! ck upload --endpoint https://collector.example/crashes
//! ck demo-crash --thread
//! ```

#![forbid(unsafe_code)]

mod transport;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use crashkeep_core::config::{CONFIG_ENV, Config, retention_age};
use crashkeep_core::error::format_error_with_remediation;
use crashkeep_core::logging::init_logging;
use crashkeep_core::store::{self, RecordSummary};
use crashkeep_core::upload::UploadScheduler;
use crashkeep_core::{CrashAgent, agent, retention};
use serde::Serialize;

use crate::transport::HttpTransport;

/// Exit code used by `demo-crash` when the agent does not end the process.
const DEMO_UNHANDLED_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ck")]
#[command(author, version, about = "Inspect and ship crash records", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Override the record directory
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List crash records, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print one record
    Show {
        /// File name, stem, or `latest`
        #[arg(default_value = "latest")]
        name: String,
    },

    /// Delete records past the retention window
    Sweep {
        /// Override `storage.retention_days` (0 disables)
        #[arg(long)]
        max_age_days: Option<u64>,
    },

    /// Upload pending records, deleting each one that is accepted
    Upload {
        /// Override `upload.endpoint`
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Print the effective configuration
    Config,

    /// Install the agent and crash on purpose
    DemoCrash {
        /// Crash with an out-of-memory panic message
        #[arg(long)]
        oom: bool,

        /// Crash on a spawned thread instead of main
        #[arg(long)]
        thread: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<crashkeep_core::Error>() {
                Some(core) => eprint!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(dir) = &cli.dir {
        config.storage.log_dir = Some(dir.clone());
    }
    // The CLI is usable without a subscriber; a bad level only costs logs.
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("warning: logging disabled: {e}");
    }

    let format = cli.format;
    match cli.command {
        Commands::List { limit } => cmd_list(&config, limit, format),
        Commands::Show { name } => cmd_show(&config, &name, format),
        Commands::Sweep { max_age_days } => cmd_sweep(&config, max_age_days, format),
        Commands::Upload { endpoint } => cmd_upload(&config, endpoint, format),
        Commands::Config => cmd_config(&config, format),
        Commands::DemoCrash { oom, thread } => cmd_demo_crash(config, oom, thread),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    loaded.map_err(|e| crashkeep_core::Error::from(e).into())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_list(config: &Config, limit: usize, format: OutputFormat) -> anyhow::Result<()> {
    let dir = config.log_dir();
    let records = store::list_records(&dir, &config.storage.record_extension, limit);

    if format == OutputFormat::Json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No crash records in {}", dir.display());
        return Ok(());
    }
    println!("{:<32} {:>10}  MODIFIED", "NAME", "BYTES");
    for record in &records {
        println!(
            "{:<32} {:>10}  {}",
            record.file_name(),
            record.len,
            modified_label(record)
        );
    }
    Ok(())
}

fn modified_label(record: &RecordSummary) -> String {
    record.modified.map_or_else(
        || "-".to_string(),
        |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

#[derive(Serialize)]
struct ShownRecord<'a> {
    #[serde(flatten)]
    summary: &'a RecordSummary,
    name: String,
    content: String,
}

fn cmd_show(config: &Config, name: &str, format: OutputFormat) -> anyhow::Result<()> {
    let dir = config.log_dir();
    let Some(record) = store::find_record(&dir, &config.storage.record_extension, name) else {
        bail!(
            "no crash record matching '{name}' in {} (run `ck list` to see what exists)",
            dir.display()
        );
    };
    let bytes = store::read_record(&record.path)
        .with_context(|| format!("failed to read {}", record.path.display()))?;
    let content = String::from_utf8_lossy(&bytes).into_owned();

    if format == OutputFormat::Json {
        return print_json(&ShownRecord {
            name: record.file_name(),
            summary: &record,
            content,
        });
    }
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn cmd_sweep(config: &Config, max_age_days: Option<u64>, format: OutputFormat) -> anyhow::Result<()> {
    let days = max_age_days.unwrap_or(config.storage.retention_days);
    let dir = config.log_dir();
    if days == 0 {
        if format == OutputFormat::Json {
            return print_json(&retention::SweepReport::default());
        }
        println!("retention disabled; nothing swept in {}", dir.display());
        return Ok(());
    }

    let report = retention::sweep(&dir, retention_age(days));
    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        println!(
            "Swept {}: scanned {}, deleted {}, failed {}",
            dir.display(),
            report.scanned,
            report.deleted_count(),
            report.failed.len()
        );
        for path in &report.deleted {
            println!("  deleted {}", path.display());
        }
        for failure in &report.failed {
            println!("  failed  {}: {}", failure.path.display(), failure.error);
        }
    }
    if !report.is_clean() {
        bail!("{} record(s) could not be deleted", report.failed.len());
    }
    Ok(())
}

fn cmd_upload(config: &Config, endpoint: Option<String>, format: OutputFormat) -> anyhow::Result<()> {
    let Some(endpoint) = endpoint.or_else(|| config.upload.endpoint.clone()) else {
        bail!("no upload endpoint; pass --endpoint or set upload.endpoint in the config");
    };
    let transport = HttpTransport::new(
        endpoint.clone(),
        Duration::from_secs(config.upload.timeout_secs),
    )?;
    let scheduler = UploadScheduler::new(Arc::new(transport), config.storage.record_extension.clone());
    let counts = scheduler.upload_pending(&config.log_dir()).counts();

    if format == OutputFormat::Json {
        print_json(&counts)?;
    } else {
        println!(
            "Uploaded to {endpoint}: dispatched {}, succeeded {}, failed {}, deleted {}",
            counts.dispatched, counts.succeeded, counts.failed, counts.deleted
        );
    }
    if counts.failed > 0 {
        bail!("{} upload(s) failed; records were kept for the next pass", counts.failed);
    }
    Ok(())
}

fn cmd_config(config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        return print_json(config);
    }
    let toml = config.to_toml().map_err(crashkeep_core::Error::from)?;
    print!("{toml}");
    println!("# log_dir resolves to {}", config.log_dir().display());
    Ok(())
}

fn cmd_demo_crash(config: Config, oom: bool, thread: bool) -> anyhow::Result<()> {
    let mut builder = CrashAgent::builder().config(config.clone());
    if let Some(endpoint) = &config.upload.endpoint {
        let transport = HttpTransport::new(
            endpoint.clone(),
            Duration::from_secs(config.upload.timeout_secs),
        )?;
        builder = builder.transport(Arc::new(transport));
    }
    let agent = Arc::new(builder.build()?);
    agent.initialize()?;
    agent::install(Arc::clone(&agent))?;
    eprintln!("crashkeep agent installed; records go to {}", agent.log_dir().display());

    let message = if oom {
        "memory allocation of 17179869184 bytes failed".to_string()
    } else {
        "demo crash requested from ck".to_string()
    };

    if thread {
        let handle = std::thread::Builder::new()
            .name("ck-demo".into())
            .spawn(move || panic!("{message}"))
            .context("failed to spawn demo thread")?;
        let _ = handle.join();
    } else {
        // Termination happens inside the hook; reaching the line after the
        // panic means it was suppressed.
        let _ = std::panic::catch_unwind(|| panic!("{message}"));
    }

    agent::uninstall();
    eprintln!("crash was handled without terminating the process");
    std::process::exit(i32::from(DEMO_UNHANDLED_EXIT))
}
