//! Tubscope - inspect hot-tub telemetry through an SSH-gated database.

mod output;
mod prompt;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use prompt::TerminalPrompt;
use tubscope_core::logging::{init_logging, LogConfig};
use tubscope_core::{
    AppState, CredentialKey, FilterKind, MetricsFilter, QueryOutcome, QueryWindow, SearchField,
    TemperatureUnit, TubscopeError,
};

#[derive(Debug, Parser)]
#[command(name = "tubscope", version, about = "Inspect device telemetry through an SSH tunnel")]
struct Cli {
    /// Log filter, e.g. "debug" or "tubscope_core=trace"
    #[arg(long, global = true)]
    log: Option<String>,

    /// Also write logs to a daily file under the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch metrics for a device, user or BLE id over a window of at most 7 days
    Query {
        /// What the filter value identifies
        #[arg(long, value_enum, default_value_t = FilterArg::Device)]
        by: FilterArg,
        /// Device name, user id or BLE id; defaults to the last query's value
        value: Option<String>,
        /// First day (e.g. 2024-01-10, 1/10/2024, Jan 10)
        #[arg(long, default_value = "")]
        start: String,
        /// Last day; defaults to the start day
        #[arg(long, default_value = "")]
        end: String,
        /// Comma-separated columns to fetch; the timestamp is always included
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
        /// Print CSV instead of an aligned table
        #[arg(long)]
        csv: bool,
    },
    /// Find users and their devices by name or user id
    Search {
        term: String,
        #[arg(long, value_enum, default_value_t = SearchArg::Name)]
        by: SearchArg,
    },
    /// Manage stored connection credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
    /// Open the tunnel and run a throwaway query
    WarmUp,
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum CredentialAction {
    /// List which credentials are set (secrets are masked)
    Show,
    /// Store one credential, e.g. `set SSH_HOST bastion.example.com`
    Set { key: String, value: String },
    /// Remove every stored credential
    Clear,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the configuration as JSON
    Show,
    /// Report temperatures in `c` or `f`
    Unit { unit: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    Device,
    User,
    Esp,
}

impl From<FilterArg> for FilterKind {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::Device => FilterKind::DeviceName,
            FilterArg::User => FilterKind::UserId,
            FilterArg::Esp => FilterKind::EspBleId,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SearchArg {
    Name,
    User,
}

impl From<SearchArg> for SearchField {
    fn from(arg: SearchArg) -> Self {
        match arg {
            SearchArg::Name => SearchField::FullName,
            SearchArg::User => SearchField::UserId,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = tubscope_core::logging::log_dir();
    let mut log_config = LogConfig::detect(log_dir.clone()).with_filter(cli.log.clone());
    if cli.log_file {
        log_config = log_config.with_file(log_dir);
    }
    let _log_handle = init_logging(log_config);

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "Starting Tubscope");

    let state = match AppState::new(Arc::new(TerminalPrompt)) {
        Ok(state) => state,
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };

    let result = run(&state, cli.command);
    state.shutdown();

    match result {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(state: &AppState, command: Command) -> Result<ExitCode, TubscopeError> {
    match command {
        Command::Query { by, value, start, end, columns, csv } => {
            let window = match value {
                Some(value) => {
                    QueryWindow::new(MetricsFilter::new(by.into(), value), start, end)
                }
                None => {
                    let last = state.config().last_query.ok_or_else(|| {
                        TubscopeError::invalid_window("no filter value given and no previous query")
                    })?;
                    QueryWindow { start_date: start, end_date: end, ..last }
                }
            };

            match state.block_on(state.query(&window, columns)) {
                QueryOutcome::Found(rows) => {
                    let mut stdout = std::io::stdout().lock();
                    if csv {
                        output::write_csv(&mut stdout, &rows)?;
                    } else {
                        output::write_table(&mut stdout, &rows)?;
                    }
                    Ok(ExitCode::SUCCESS)
                }
                QueryOutcome::Empty(empty) => {
                    println!("{empty}");
                    if let Some(detail) = empty.detail() {
                        println!("{detail}");
                    }
                    Ok(ExitCode::from(2))
                }
                QueryOutcome::Failed(e) if e.is_cancelled() => {
                    println!("Cancelled.");
                    Ok(ExitCode::from(130))
                }
                QueryOutcome::Failed(e) => Err(e),
            }
        }

        Command::Search { term, by } => {
            state.block_on(async {
                state.connector().connect().await?.require_connected()?;
                let owners = state.orchestrator().search(by.into(), &term).await?;
                output::write_owners(&mut std::io::stdout().lock(), &owners)?;
                Ok::<_, TubscopeError>(ExitCode::SUCCESS)
            })
        }

        Command::Credentials { action } => {
            let credentials = state.credentials();
            match action {
                CredentialAction::Show => {
                    let creds = credentials.load()?;
                    println!("store: {} (service {})", credentials.store().name(), credentials.service());
                    for key in CredentialKey::ALL {
                        let value = creds.get(key);
                        let shown = match (value.is_empty(), key.is_secret()) {
                            (true, _) => "<unset>".to_string(),
                            (false, true) => "********".to_string(),
                            (false, false) => value.to_string(),
                        };
                        println!("{:<18} {shown}", key.as_str());
                    }
                }
                CredentialAction::Set { key, value } => {
                    let key = CredentialKey::parse(&key).ok_or_else(|| {
                        TubscopeError::config(format!("unknown credential key '{key}'"))
                    })?;
                    credentials.set(key, &value)?;
                    println!("{key} saved");
                }
                CredentialAction::Clear => {
                    credentials.clear()?;
                    println!("Credentials cleared");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::WarmUp => {
            state.block_on(state.warm_up());
            println!("{}", state.connection_state());
            Ok(ExitCode::SUCCESS)
        }

        Command::Config { action } => {
            match action {
                ConfigAction::Show => {
                    println!("{}", state.config().to_json_pretty()?);
                }
                ConfigAction::Unit { unit } => {
                    let unit = TemperatureUnit::parse(&unit).ok_or_else(|| {
                        TubscopeError::config(format!("'{unit}' is not a unit; use c or f"))
                    })?;
                    state.update_config(|c| c.temperature_unit = unit)?;
                    println!("Temperature unit set to {unit:?}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report(error: &TubscopeError) {
    let info = error.to_error_info();
    eprintln!("{}: {}", info.error_type, info.message);
    if let Some(hint) = info.hint {
        eprintln!("hint: {hint}");
    }
    tracing::error!(category = error.category(), error = %error, "Command failed");
}
