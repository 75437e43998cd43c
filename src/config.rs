//! Configuration for mongo-fleet
//!
//! CLI arguments and environment variable handling using clap. Global
//! options configure the entity store, logging and the client pool; each
//! subcommand is one fleet operation.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::admin::Inspection;
use crate::pool::PoolConfig;
use crate::topology::{MemberOptions, ProbeConfig};

/// mongo-fleet - control plane for a multi-tenant MongoDB fleet
#[derive(Parser, Debug, Clone)]
#[command(name = "mongo-fleet")]
#[command(about = "Provision tenants and operate replica sets across a MongoDB fleet")]
pub struct Args {
    /// Entity store connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// Entity store database name
    #[arg(long, env = "MONGODB_DB", default_value = "mongo_fleet")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Close pooled clients idle for this many seconds
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "150")]
    pub idle_timeout_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, env = "REAPER_INTERVAL_SECS", default_value = "15")]
    pub reaper_interval_secs: u64,

    /// Per-member hello timeout during primary discovery
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value = "5000")]
    pub probe_timeout_ms: u64,

    /// Members probed at once during primary discovery
    #[arg(long, env = "PROBE_CONCURRENCY", default_value = "4")]
    pub probe_concurrency: usize,

    /// Connect every enabled server before running the command
    #[arg(long, env = "WARM_POOL", default_value = "false")]
    pub warm_pool: bool,

    /// Use an in-memory entity store instead of MongoDB
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Allocate a database and user for a tenant
    Provision {
        /// Preferred zone
        #[arg(long)]
        zone: Option<String>,
        /// Name prefix for the database and user
        #[arg(long, default_value = "provision")]
        prefix: String,
    },

    /// Print connection details for a provision
    Pack {
        id: String,
        /// Print KEY=value lines instead of JSON
        #[arg(long)]
        env: bool,
    },

    /// Release a provision
    Deprovision { id: String },

    /// Initiate a replica set with its recorded members
    Initiate { replica_set: String },

    /// Add a server to a replica set
    AddMember {
        replica_set: String,
        server: String,
        #[arg(long)]
        arbiter_only: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        build_indexes: bool,
        #[arg(long)]
        hidden: bool,
        #[arg(long, default_value_t = 1.0)]
        priority: f64,
        #[arg(long, default_value_t = 1)]
        votes: i32,
    },

    /// Remove a server from a replica set
    RemoveMember { replica_set: String, server: String },

    /// Ask the primary to step down
    StepDown {
        replica_set: String,
        #[arg(long, default_value_t = 60)]
        seconds: u32,
    },

    /// Show replica-set status
    RsStatus {
        replica_set: String,
        /// Print only the inferred state
        #[arg(long)]
        state: bool,
    },

    /// Server introspection and availability
    #[command(subcommand)]
    Server(ServerCommands),

    /// Remote user administration
    #[command(subcommand)]
    User(UserCommands),

    /// Per-database maintenance
    #[command(subcommand)]
    Database(DatabaseCommands),

    /// Bootstrap a fleet from a JSON file
    Seed {
        file: PathBuf,
        /// Initiate the replica set after writing records
        #[arg(long)]
        initiate: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InspectKind {
    Status,
    Build,
    Databases,
    Collections,
    Users,
    Roles,
    Privileges,
    Commands,
    Features,
    Logs,
    Connections,
    HostInfo,
    ConnPoolStats,
}

impl InspectKind {
    pub fn into_inspection(self, database: Option<String>) -> Result<Inspection, String> {
        Ok(match self {
            Self::Status => Inspection::Status,
            Self::Build => Inspection::Build,
            Self::Databases => Inspection::Databases,
            Self::Collections => Inspection::Collections {
                database: database.ok_or("--database is required for collections")?,
            },
            Self::Users => Inspection::Users,
            Self::Roles => Inspection::Roles,
            Self::Privileges => Inspection::Privileges,
            Self::Commands => Inspection::Commands,
            Self::Features => Inspection::Features,
            Self::Logs => Inspection::Logs,
            Self::Connections => Inspection::Connections,
            Self::HostInfo => Inspection::HostInfo,
            Self::ConnPoolStats => Inspection::ConnPoolStats,
        })
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum ServerCommands {
    /// Run a read-only admin command
    Inspect {
        id: String,
        #[arg(value_enum)]
        what: InspectKind,
        #[arg(long)]
        database: Option<String>,
    },
    /// Drop the server's pooled connections to a host
    DropConnection { id: String, host: String, port: u16 },
    Enable { id: String },
    Disable { id: String },
    /// Find an enabled server, preferring a zone
    Lookup {
        #[arg(long)]
        zone: Option<String>,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum UserCommands {
    Info { id: String },
    /// Create the user where missing, update it elsewhere
    Ensure { id: String },
    Drop { id: String },
    Grant {
        id: String,
        #[arg(value_delimiter = ',', required = true)]
        roles: Vec<String>,
    },
    Revoke {
        id: String,
        #[arg(value_delimiter = ',', required = true)]
        roles: Vec<String>,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum DatabaseCommands {
    Stats { id: String },
    CollStats { id: String, collection: String },
    /// Convert a collection to a capped collection
    Cap { id: String, collection: String, size: i64 },
    CreateIndex {
        id: String,
        collection: String,
        /// Index keys as JSON, e.g. '{"email": 1}'
        keys: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        unique: bool,
    },
    DropIndex { id: String, collection: String, name: String },
}

impl Args {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
        }
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_millis(self.probe_timeout_ms),
            concurrency: self.probe_concurrency,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_timeout_secs == 0 {
            return Err("IDLE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        if self.reaper_interval_secs == 0 {
            return Err("REAPER_INTERVAL_SECS must be greater than 0".to_string());
        }

        if self.reaper_interval_secs > self.idle_timeout_secs {
            return Err("REAPER_INTERVAL_SECS must not exceed IDLE_TIMEOUT_SECS".to_string());
        }

        if self.probe_timeout_ms == 0 {
            return Err("PROBE_TIMEOUT_MS must be greater than 0".to_string());
        }

        if self.probe_concurrency == 0 {
            return Err("PROBE_CONCURRENCY must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Commands {
    /// Member options of an `add-member` invocation
    pub fn member_options(&self) -> Option<MemberOptions> {
        match self {
            Self::AddMember {
                arbiter_only,
                build_indexes,
                hidden,
                priority,
                votes,
                ..
            } => Some(MemberOptions {
                arbiter_only: *arbiter_only,
                build_indexes: *build_indexes,
                hidden: *hidden,
                priority: *priority,
                votes: *votes,
            }),
            _ => None,
        }
    }
}
