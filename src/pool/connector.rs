//! Driver seam for fleet-member connections
//!
//! [`Connector`] opens a connection for a server and hands back a
//! [`CommandRunner`] that issues admin commands over it. The pool only ever
//! talks to these traits, so tests can script a whole fleet in memory.

use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::event::cmap::CmapEvent;
use mongodb::event::command::CommandEvent;
use mongodb::event::sdam::SdamEvent;
use mongodb::event::EventHandler;
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::schemas::ServerDoc;
use crate::types::{FleetError, Result};

/// A live connection to one fleet member
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a database command and return the server's reply
    async fn run_command(&self, db: &str, command: Document) -> Result<Document>;

    /// Disconnect
    async fn close(&self) -> Result<()>;
}

/// Opens connections to fleet members
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &ServerDoc, uri: &str) -> Result<Arc<dyn CommandRunner>>;
}

/// Name of a command document (its first key)
pub fn command_name(command: &Document) -> &str {
    command.keys().next().map(String::as_str).unwrap_or("<empty>")
}

/// Connector backed by the official MongoDB driver
#[derive(Debug, Clone, Default)]
pub struct MongoConnector {
    app_name: Option<String>,
}

impl MongoConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self, server: &ServerDoc, uri: &str) -> Result<Arc<dyn CommandRunner>> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| FleetError::remote("connect", e))?;

        options.app_name = self.app_name.clone();
        attach_event_logging(&mut options, &server.name);

        let client = Client::with_options(options).map_err(|e| FleetError::remote("connect", e))?;

        // The driver connects lazily; make failures surface here
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| FleetError::remote("ping", e))?;

        Ok(Arc::new(MongoRunner { client }))
    }
}

/// Relay driver pool, topology and command events into the log
fn attach_event_logging(options: &mut ClientOptions, server: &str) {
    let label = server.to_string();
    options.cmap_event_handler = Some(EventHandler::callback(move |event: CmapEvent| match event {
        CmapEvent::ConnectionCheckoutFailed(e) => {
            warn!(server = %label, event = ?e, "mongodb.client.connectionCheckOutFailed")
        }
        other => debug!(server = %label, event = ?other, "mongodb.client.cmap"),
    }));

    let label = server.to_string();
    options.sdam_event_handler = Some(EventHandler::callback(move |event: SdamEvent| match event {
        SdamEvent::ServerHeartbeatFailed(e) => {
            warn!(server = %label, event = ?e, "mongodb.client.serverHeartbeatFailed")
        }
        other => debug!(server = %label, event = ?other, "mongodb.client.sdam"),
    }));

    let label = server.to_string();
    options.command_event_handler = Some(EventHandler::callback(move |event: CommandEvent| match event {
        CommandEvent::Failed(e) => {
            warn!(server = %label, command = %e.command_name, failure = %e.failure, "mongodb.client.commandFailed")
        }
        other => debug!(server = %label, event = ?other, "mongodb.client.command"),
    }));
}

struct MongoRunner {
    client: Client,
}

#[async_trait]
impl CommandRunner for MongoRunner {
    async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        let name = command_name(&command).to_string();
        self.client
            .database(db)
            .run_command(command)
            .await
            .map_err(|e| FleetError::remote(&name, e))
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
