//! mongo-fleet - control plane for a multi-tenant MongoDB fleet

use anyhow::Context;
use bson::{doc, Bson, Document};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mongo_fleet::{
    admin::{DatabaseAdmin, ServerAdmin, UserAdmin},
    config::{Args, Commands, DatabaseCommands, ServerCommands, UserCommands},
    db::{redact, schemas::ServerDoc, MongoClient},
    pool::{ClientPool, MongoConnector},
    provision::ProvisioningAllocator,
    seed::{self, FleetSeed},
    store::{parse_id, EntityStore, MemoryStore, MongoStore},
    topology::TopologyOrchestrator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mongo_fleet={},info", args.log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  mongo-fleet");
    info!("======================================");
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT (in-memory store)" } else { "PRODUCTION" });
    if !args.dev_mode {
        info!("Entity store: {} / {}", redact(&args.mongodb_uri), args.mongodb_db);
    }
    info!(
        "Pool: idle timeout {}s, reaper every {}s",
        args.idle_timeout_secs, args.reaper_interval_secs
    );
    info!(
        "Probes: {}ms timeout, {} at once",
        args.probe_timeout_ms, args.probe_concurrency
    );
    info!("======================================");

    if args.dev_mode {
        run(Arc::new(MemoryStore::new()), args).await
    } else {
        let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db)
            .await
            .context("entity store unavailable")?;
        let store = MongoStore::new(mongo).await?;
        run(Arc::new(store), args).await
    }
}

/// Wire the coordinators, run one command, then close every client
async fn run<S: EntityStore + 'static>(store: Arc<S>, args: Args) -> anyhow::Result<()> {
    let connector = Arc::new(MongoConnector::new().with_app_name("mongo-fleet"));
    let pool = Arc::new(ClientPool::new(connector, args.pool_config()));
    pool.start_reaper().await;

    if args.warm_pool {
        let servers = store.find::<ServerDoc>(doc! { "enabled": true }).await?;
        let connected = pool.connect_all(store.as_ref(), &servers).await;
        info!("Pool warmed: {}/{} servers connected", connected, servers.len());
    }

    let topology = Arc::new(
        TopologyOrchestrator::new(store.clone(), pool.clone()).with_probe_config(args.probe_config()),
    );

    let result = dispatch(&store, &pool, &topology, args.command).await;

    pool.shutdown().await;
    result
}

async fn dispatch<S: EntityStore + 'static>(
    store: &Arc<S>,
    pool: &Arc<ClientPool>,
    topology: &Arc<TopologyOrchestrator<S>>,
    command: Commands,
) -> anyhow::Result<()> {
    let allocator = ProvisioningAllocator::new(store.clone(), topology.clone());
    let member_options = command.member_options().unwrap_or_default();

    match command {
        Commands::Provision { zone, prefix } => {
            let id = allocator.provision(zone.as_deref(), Some(&prefix)).await?;
            println!("{}", id.to_hex());
        }
        Commands::Pack { id, env } => {
            let pack = allocator.pack(&parse_id("provision", &id)?).await?;
            if env {
                print!("{}", pack.to_env());
            } else {
                print_json(&pack)?;
            }
        }
        Commands::Deprovision { id } => {
            let id = allocator.deprovision(&parse_id("provision", &id)?).await?;
            println!("{}", id.to_hex());
        }
        Commands::Initiate { replica_set } => {
            let reply = topology.initiate(&parse_id("replica set", &replica_set)?).await?;
            print_document(reply)?;
        }
        Commands::AddMember { replica_set, server, .. } => {
            let version = topology
                .add_member(
                    &parse_id("replica set", &replica_set)?,
                    &parse_id("server", &server)?,
                    &member_options,
                )
                .await?;
            println!("config version {}", version);
        }
        Commands::RemoveMember { replica_set, server } => {
            let version = topology
                .remove_member(
                    &parse_id("replica set", &replica_set)?,
                    &parse_id("server", &server)?,
                )
                .await?;
            println!("config version {}", version);
        }
        Commands::StepDown { replica_set, seconds } => {
            let reply = topology
                .step_down(&parse_id("replica set", &replica_set)?, seconds)
                .await?;
            print_document(reply)?;
        }
        Commands::RsStatus { replica_set, state } => {
            let id = parse_id("replica set", &replica_set)?;
            if state {
                println!("{}", topology.state(&id).await?);
            } else {
                print_document(topology.status(&id).await?)?;
            }
        }
        Commands::Server(command) => {
            let admin = ServerAdmin::new(store.clone(), pool.clone());
            match command {
                ServerCommands::Inspect { id, what, database } => {
                    let inspection = what.into_inspection(database).map_err(anyhow::Error::msg)?;
                    print_document(admin.inspect(&parse_id("server", &id)?, &inspection).await?)?;
                }
                ServerCommands::DropConnection { id, host, port } => {
                    print_document(admin.drop_connection(&parse_id("server", &id)?, &host, port).await?)?;
                }
                ServerCommands::Enable { id } => print_json(&admin.enable(&parse_id("server", &id)?).await?)?,
                ServerCommands::Disable { id } => print_json(&admin.disable(&parse_id("server", &id)?).await?)?,
                ServerCommands::Lookup { zone } => print_json(&admin.lookup(zone.as_deref()).await?)?,
            }
        }
        Commands::User(command) => {
            let admin = UserAdmin::new(store.clone(), topology.clone());
            match command {
                UserCommands::Info { id } => {
                    for info in admin.info(&parse_id("user", &id)?).await? {
                        print_document(info)?;
                    }
                }
                UserCommands::Ensure { id } => {
                    let user = admin.ensure(&parse_id("user", &id)?).await?;
                    println!("{}", user.name);
                }
                UserCommands::Drop { id } => {
                    println!("{}", admin.drop(&parse_id("user", &id)?).await?.to_hex());
                }
                UserCommands::Grant { id, roles } => {
                    let user = admin.grant_roles(&parse_id("user", &id)?, &roles).await?;
                    println!("{}: {}", user.name, user.roles.join(","));
                }
                UserCommands::Revoke { id, roles } => {
                    let user = admin.revoke_roles(&parse_id("user", &id)?, &roles).await?;
                    println!("{}: {}", user.name, user.roles.join(","));
                }
            }
        }
        Commands::Database(command) => {
            let admin = DatabaseAdmin::new(store.clone(), topology.clone());
            let reply = match command {
                DatabaseCommands::Stats { id } => admin.db_stats(&parse_id("database", &id)?).await?,
                DatabaseCommands::CollStats { id, collection } => {
                    admin.coll_stats(&parse_id("database", &id)?, &collection).await?
                }
                DatabaseCommands::Cap { id, collection, size } => {
                    admin
                        .convert_to_capped(&parse_id("database", &id)?, &collection, size)
                        .await?
                }
                DatabaseCommands::CreateIndex {
                    id,
                    collection,
                    keys,
                    name,
                    unique,
                } => {
                    let keys: serde_json::Value = serde_json::from_str(&keys).context("index keys must be JSON")?;
                    let keys = match Bson::try_from(keys).context("index keys must be a JSON object")? {
                        Bson::Document(keys) => keys,
                        _ => anyhow::bail!("index keys must be a JSON object"),
                    };
                    admin
                        .create_index(&parse_id("database", &id)?, &collection, keys, name.as_deref(), unique)
                        .await?
                }
                DatabaseCommands::DropIndex { id, collection, name } => {
                    admin
                        .drop_index(&parse_id("database", &id)?, &collection, &name)
                        .await?
                }
            };
            print_document(reply)?;
        }
        Commands::Seed { file, initiate } => {
            let mut fleet = FleetSeed::from_file(&file)
                .with_context(|| format!("reading seed {}", file.display()))?;
            fleet.initiate |= initiate;
            let report = seed::apply(store.as_ref(), Some(topology.as_ref()), &fleet).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_document(document: Document) -> anyhow::Result<()> {
    print_json(&Bson::Document(document).into_relaxed_extjson())
}
