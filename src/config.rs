use clap::{Parser, Subcommand};
use serde::Deserialize;

use tallydb_core::SCHEMA_VERSION;

#[derive(Parser, Debug)]
#[command(name = "tallydb", about = "TallyDB - embedded ledger for personal finances")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "tallydb.toml")]
    pub config: String,

    /// Database path (overrides config file)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Print results as JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Insert or replace a category
    AddCategory {
        name: String,
        #[arg(long, default_value = "")]
        icon: String,
        #[arg(long, default_value_t = 0.0)]
        budget_limit: f64,
        /// Existing id to replace; 0 allocates a new one
        #[arg(long, default_value_t = 0)]
        id: i64,
    },
    /// Insert or replace a transaction (an expense unless --income is given)
    AddTransaction {
        #[arg(allow_negative_numbers = true)]
        amount: f64,
        #[arg(long)]
        category: i64,
        #[arg(long, default_value = "")]
        note: String,
        #[arg(long)]
        income: bool,
        /// Milliseconds since the Unix epoch; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
        #[arg(long, default_value_t = 0)]
        id: i64,
    },
    /// Insert or replace a monthly budget
    AddBudget {
        #[arg(long)]
        category: i64,
        limit: f64,
        /// MM-yyyy; defaults to the current month
        #[arg(long)]
        month: Option<String>,
        #[arg(long, default_value_t = 0)]
        id: i64,
    },
    DeleteCategory { id: i64 },
    DeleteTransaction { id: i64 },
    DeleteBudget { id: i64 },
    /// Delete every transaction
    ClearTransactions,
    Transactions,
    Categories,
    Budgets {
        #[arg(long)]
        month: Option<String>,
    },
    /// Income, expenses, category and daily totals and budgets for one month
    Summary {
        #[arg(long)]
        month: Option<String>,
    },
    /// Record the transaction in a bank SMS alert
    ImportSms {
        message: String,
        /// Milliseconds since the Unix epoch; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Expenses that repeat about once a month
    Recurring,
    /// Print category totals every time they change, until Ctrl-C
    Watch {
        #[arg(long)]
        month: Option<String>,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// File path, or `:memory:` for a private volatile store.
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl DatabaseConfig {
    pub fn new(backend: BackendKind, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            backend,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(BackendKind::Memory, ":memory:")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        path: default_path(),
        backend: BackendKind::default(),
        schema_version: default_schema_version(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_path() -> String {
    "tallydb.db".to_string()
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: default_database(),
            logging: default_logging(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(ref path) = cli.database {
            config.database.path = path.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
