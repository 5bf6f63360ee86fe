use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dialoguer::{Input, Password};
use miette::IntoDiagnostic;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use cds_sync::cancel::CancelToken;
use cds_sync::config::{CliOverrides, ConfigLoader, ResolvedConfig};
use cds_sync::convert::MakeBlastDb;
use cds_sync::domain::{Credentials, SyncMode, Username};
use cds_sync::error::SyncError;
use cds_sync::layout::MirrorLayout;
use cds_sync::output::{JsonOutput, OutputMode, TextOutput};
use cds_sync::portal::JgiPortalClient;
use cds_sync::sync::{SyncOptions, SyncReport, Syncer};

const PASSWORD_ENV: &str = "CDS_SYNC_PASSWORD";

#[derive(Parser)]
#[command(name = "cds-sync")]
#[command(about = "Mirror CDS files from the JGI Genomes Portal and build BLAST databases")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', global = true, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch CDS files and convert them to BLAST databases")]
    Fetch(FetchArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long, short = 'c', help = "Use this configuration file")]
    config: Option<PathBuf>,

    #[arg(long, short = 'b', help = "Base directory for species databases")]
    base: Option<PathBuf>,

    #[arg(long, short = 'u', help = "Username (e-mail) for the JGI Genomes Portal")]
    user: Option<String>,

    #[arg(
        long,
        short = 'p',
        help = "Password for the JGI Genomes Portal (prompted for if omitted)"
    )]
    password: Option<String>,

    #[arg(long, conflicts_with = "convert_only", help = "Do not convert, just fetch")]
    fetch_only: bool,

    #[arg(long, help = "Do not fetch, just convert local files")]
    convert_only: bool,

    #[arg(long, help = "Path to makeblastdb")]
    makeblastdb: Option<PathBuf>,

    #[arg(long, short = 'j', help = "Parallel downloads and conversions")]
    threads: Option<usize>,

    #[arg(long, help = "Download attempts per file before giving up")]
    max_attempts: Option<u32>,

    #[arg(long, help = "Portal organism listing, e.g. PhytozomeV10")]
    organism: Option<String>,

    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Verbosity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Verbosity::Trace => "trace",
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warn => "warn",
            Verbosity::Error => "error",
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(report) => {
            if report.cancelled {
                ExitCode::from(130)
            } else if report.has_failures() {
                ExitCode::from(5)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::Auth(_)
        | SyncError::MissingCredentials
        | SyncError::InvalidUsername(_)
        | SyncError::MissingConfig(_)
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_) => 2,
        SyncError::Network(_)
        | SyncError::PortalStatus { .. }
        | SyncError::RetriesExhausted { .. } => 3,
        SyncError::Permission { .. } => 4,
        SyncError::Cancelled => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<SyncReport> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.verbosity.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Fetch(args) => run_fetch(args),
    }
}

fn run_fetch(args: FetchArgs) -> miette::Result<SyncReport> {
    let mode = if args.fetch_only {
        SyncMode::FetchOnly
    } else if args.convert_only {
        SyncMode::ConvertOnly
    } else {
        SyncMode::FetchAndConvert
    };
    let output_mode = if args.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let file = ConfigLoader::load(args.config.as_deref())?;
    let cwd = std::env::current_dir().into_diagnostic()?;
    let overrides = CliOverrides {
        base: args.base,
        user: args.user,
        makeblastdb: args.makeblastdb,
        threads: args.threads,
        max_attempts: args.max_attempts,
        organism: args.organism,
    };
    let config = ResolvedConfig::merge(overrides, file, &cwd)?;
    debug!(?config, %mode, "resolved configuration");

    let credentials = if mode.fetches() {
        Some(resolve_credentials(config.user.clone(), args.password)?)
    } else {
        None
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("Interrupted, finishing in-flight work (press Ctrl-C again to abort)");
        handler_token.cancel();
    })
    .into_diagnostic()?;

    let converter = MakeBlastDb::new(config.makeblastdb.clone());
    if mode.converts() && converter.program().is_none() {
        warn!("makeblastdb not found; conversions will fail (set --makeblastdb)");
    }

    let syncer = Syncer::new(
        MirrorLayout::new(config.base.clone()),
        JgiPortalClient::new(config.portal.clone()),
        converter,
        SyncOptions {
            mode,
            threads: config.threads,
            retry: config.retry,
        },
        cancel,
    );

    let report = match output_mode {
        OutputMode::Json => {
            let report = syncer.run(credentials.as_ref(), &JsonOutput)?;
            JsonOutput::print_report(&report).into_diagnostic()?;
            report
        }
        OutputMode::Text => {
            let report = syncer.run(credentials.as_ref(), &TextOutput)?;
            TextOutput::print_summary(&report);
            report
        }
    };
    Ok(report)
}

/// Fill in whatever the command line and config did not provide, interactively.
fn resolve_credentials(
    user: Option<String>,
    password: Option<String>,
) -> Result<Credentials, SyncError> {
    let user = match user {
        Some(user) => user,
        None => Input::<String>::new()
            .with_prompt("Username for JGI Genomes Portal")
            .interact_text()
            .map_err(|_| SyncError::MissingCredentials)?,
    };
    let user: Username = user.parse()?;

    let password = match password.or_else(|| std::env::var(PASSWORD_ENV).ok()) {
        Some(password) => password,
        None => Password::new()
            .with_prompt("Password for JGI Genomes Portal")
            .interact()
            .map_err(|_| SyncError::MissingCredentials)?,
    };
    if password.is_empty() {
        return Err(SyncError::MissingCredentials);
    }
    Ok(Credentials::new(user, password))
}
