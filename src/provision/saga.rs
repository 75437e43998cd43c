//! Compensation bookkeeping for multi-step provisioning
//!
//! Each completed step records how to undo itself. If a later step fails,
//! the recorded compensations run newest first and the original error is
//! reported. Compensation failures are logged and do not stop the unwind.

use bson::{doc, oid::ObjectId};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::schemas::{DatabaseDoc, ReplicaSetDoc, UserDoc};
use crate::pool::ClientHandle;
use crate::store::EntityStore;
use crate::types::Result;

/// Undo action for one completed step
pub enum Compensation {
    /// Drop a user created on a fleet member
    DropRemoteUser {
        client: Arc<ClientHandle>,
        authdb: String,
        name: String,
    },
    RemoveDatabase(ObjectId),
    RemoveUser(ObjectId),
    /// Pull a user/database pair back out of a replica set record
    Detach {
        replica_set: ObjectId,
        user: ObjectId,
        database: ObjectId,
    },
}

impl Compensation {
    fn describe(&self) -> String {
        match self {
            Self::DropRemoteUser { name, .. } => format!("drop remote user {}", name),
            Self::RemoveDatabase(id) => format!("remove database record {}", id),
            Self::RemoveUser(id) => format!("remove user record {}", id),
            Self::Detach { replica_set, .. } => format!("detach from replica set {}", replica_set),
        }
    }

    async fn run<S>(self, store: &S) -> Result<()>
    where
        S: EntityStore + ?Sized,
    {
        match self {
            Self::DropRemoteUser { client, authdb, name } => {
                client.run_command(&authdb, doc! { "dropUser": name }).await?;
            }
            Self::RemoveDatabase(id) => {
                store.remove::<DatabaseDoc>(&id).await?;
            }
            Self::RemoveUser(id) => {
                store.remove::<UserDoc>(&id).await?;
            }
            Self::Detach {
                replica_set,
                user,
                database,
            } => {
                store
                    .update::<ReplicaSetDoc>(
                        &replica_set,
                        doc! { "$pull": { "users": user, "databases": database } },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// Ordered record of completed steps
pub struct Saga {
    name: String,
    completed: Vec<Compensation>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            completed: Vec::new(),
        }
    }

    /// Note a completed step and how to undo it
    pub fn record(&mut self, compensation: Compensation) {
        self.completed.push(compensation);
    }

    /// Number of steps that would be undone
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Undo every recorded step, newest first. Returns how many compensations
    /// succeeded.
    pub async fn compensate<S>(self, store: &S) -> usize
    where
        S: EntityStore + ?Sized,
    {
        let total = self.completed.len();
        let mut undone = 0;

        for compensation in self.completed.into_iter().rev() {
            let step = compensation.describe();
            match compensation.run(store).await {
                Ok(()) => undone += 1,
                Err(e) => warn!(saga = %self.name, step = %step, error = %e, "Compensation failed"),
            }
        }

        info!(saga = %self.name, undone, total, "Rolled back");
        undone
    }

    /// Finish successfully, discarding the compensations
    pub fn commit(self) {
        info!(saga = %self.name, steps = self.completed.len(), "Committed");
    }
}
