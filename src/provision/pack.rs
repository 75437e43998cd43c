//! Connection descriptors handed to tenants

use serde::{Deserialize, Serialize};

/// Everything a tenant needs to connect to its provision, keyed the way
/// the values are exported as environment variables
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPack {
    #[serde(rename = "MONGO_USERNAME")]
    pub username: String,
    #[serde(rename = "MONGO_PASSWORD")]
    pub password: String,
    #[serde(rename = "MONGO_DATABASE")]
    pub database: String,
    #[serde(rename = "MONGO_HOST")]
    pub host: String,
    #[serde(rename = "MONGO_PORT")]
    pub port: u16,
    #[serde(rename = "MONGO_REPLICA_SET")]
    pub replica_set: String,
    #[serde(rename = "MONGO_URI")]
    pub uri: String,
}

impl ConnectionPack {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        replica_set: impl Into<String>,
    ) -> Self {
        let mut pack = Self {
            username: username.into(),
            password: password.into(),
            database: database.into(),
            host: host.into(),
            port,
            replica_set: replica_set.into(),
            uri: String::new(),
        };
        pack.uri = pack.build_uri();
        pack
    }

    /// Users are created in `admin`, so the URI always authenticates there
    fn build_uri(&self) -> String {
        format!(
            "mongodb://{}:{}@{}:{}/{}?authSource=admin&replicaSet={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            self.database,
            urlencoding::encode(&self.replica_set)
        )
    }

    /// `KEY=value` lines for an env file
    pub fn to_env(&self) -> String {
        [
            ("MONGO_USERNAME", self.username.clone()),
            ("MONGO_PASSWORD", self.password.clone()),
            ("MONGO_DATABASE", self.database.clone()),
            ("MONGO_HOST", self.host.clone()),
            ("MONGO_PORT", self.port.to_string()),
            ("MONGO_REPLICA_SET", self.replica_set.clone()),
            ("MONGO_URI", self.uri.clone()),
        ]
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect()
    }
}

impl std::fmt::Debug for ConnectionPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPack")
            .field("username", &self.username)
            .field("password", &"****")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("replica_set", &self.replica_set)
            .finish()
    }
}
