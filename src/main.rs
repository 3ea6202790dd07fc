//! zipwater: drinking-water contaminant lookup by zip code.
//!
//! `serve` runs the HTTP API. The other subcommands run the same engine
//! once from the shell and print JSON, which is how the crosswalk and
//! measurement files are checked before a deploy.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use zipwater_service::config::Config;
use zipwater_service::logging::{self, LogSource};
use zipwater_service::model::validate_zip;
use zipwater_service::ranking::{self, RankRequest};
use zipwater_service::store::{MemoryStore, PgStore};
use zipwater_service::{api, coverage, db, ingest, verify};

#[derive(Parser)]
#[command(name = "zipwater")]
#[command(about = "Coverage-weighted drinking water contaminant rankings by zip code", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to zipwater.toml, or $ZIPWATER_CONFIG)
    #[arg(short, long, global = true, env = "ZIPWATER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Listen address, overriding server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// Create tables and indexes (idempotent)
    Schema,
    /// Load the measurement file and the zip crosswalk, replacing what is stored
    Ingest {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        zipmap: PathBuf,
        /// Validate and report against an in-memory store; the database is untouched
        #[arg(long)]
        dry_run: bool,
    },
    /// Water systems serving a zip
    Lookup {
        zip: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Ranked contaminant estimates for a zip
    Rank {
        zip: String,
        #[arg(long)]
        top_n: Option<i64>,
        #[arg(long)]
        year: Option<i32>,
        /// Rank for this system only (exact name), even if the zip does not list it
        #[arg(long)]
        pws: Option<String>,
    },
    /// Check the loaded data for unmeasured systems and overlapping coverage
    Verify {
        /// Print the report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logger(&config.logging.level, config.logging.file.as_deref()) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli.command, config) {
        Ok(code) => code,
        Err(e) => {
            logging::error(LogSource::System, None, &e.to_string());
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, mut config: Config) -> Result<ExitCode, Box<dyn Error>> {
    match command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            logging::info(
                LogSource::System,
                None,
                &format!("starting against {}", db::redact_dsn(&config.database.url)),
            );
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(api::serve(&config))?;
        }

        Command::Schema => {
            let mut client = db::connect(&config.database)?;
            db::apply_schema(&mut client)?;
            println!("✓ schema applied to {}", db::redact_dsn(&config.database.url));
        }

        Command::Ingest { data, zipmap, dry_run } => {
            let report = if dry_run {
                let mut store = MemoryStore::new();
                ingest::ingest_files(&mut store, &data, &zipmap, &config.ingest)?
            } else {
                let client = db::connect_and_verify(&config.database, db::REQUIRED_TABLES)?;
                let mut store = PgStore::new(client);
                ingest::ingest_files(&mut store, &data, &zipmap, &config.ingest)?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Lookup { zip, limit } => {
            let limit = limit.unwrap_or(config.server.default_candidates as usize);
            validate_zip(&zip)?;
            let mut store = PgStore::connect(&config.database)?;
            match coverage::lookup(&mut store, &zip, limit) {
                Ok(systems) => println!("{}", serde_json::to_string_pretty(&systems)?),
                Err(e) => {
                    logging::log_lookup_failure(&zip, "lookup", &e);
                    eprintln!("{}", e);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Command::Rank { zip, top_n, year, pws } => {
            let request = RankRequest {
                zip,
                top_n: top_n.unwrap_or(config.server.default_top_n),
                year,
                pws,
            };
            request.validate()?;
            let mut store = PgStore::connect(&config.database)?;
            match ranking::rank_zip(&mut store, &request) {
                Ok(ranking) => println!("{}", serde_json::to_string_pretty(&ranking)?),
                Err(e) => {
                    logging::log_lookup_failure(&request.zip, "rank", &e);
                    eprintln!("{}", e);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Command::Verify { json } => {
            let mut store = PgStore::connect(&config.database)?;
            let report = verify::run_verification(&mut store)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                verify::print_summary(&report);
            }
            if report.status == verify::VerificationStatus::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
