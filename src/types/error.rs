//! Error types for mongo-fleet

/// Main error type for fleet operations
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// A server, replica set, user, database or provision id did not resolve
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input, rejected before any network I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// A driver connect or admin command failed on a fleet member
    #[error("Remote command failed: {0}")]
    RemoteCommand(String),

    /// No member of the replica set reported itself as primary
    #[error("No primary found for replica set {0}")]
    NoPrimary(String),

    /// The candidate host:port is already part of the replica-set config
    #[error("Host already a member: {0}")]
    MemberExists(String),

    /// The entity store failed
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Build a remote command error from a driver error
    pub fn remote(command: &str, err: impl std::fmt::Display) -> Self {
        Self::RemoteCommand(format!("{}: {}", command, err))
    }

    /// Build a not-found error for an entity kind and id
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", kind, id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for failures that originated on a fleet member rather than locally
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteCommand(_) | Self::NoPrimary(_) | Self::MemberExists(_)
        )
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON error: {}", err))
    }
}

impl From<bson::ser::Error> for FleetError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON serialization failed: {}", err))
    }
}

impl From<bson::de::Error> for FleetError {
    fn from(err: bson::de::Error) -> Self {
        Self::Database(format!("BSON deserialization failed: {}", err))
    }
}

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;
