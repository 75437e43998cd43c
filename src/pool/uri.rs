//! Connection strings for fleet members

use crate::db::schemas::{ServerDoc, UserDoc};

/// Server selection timeout embedded in every member connection string
pub const SERVER_SELECTION_TIMEOUT_MS: u64 = 150_000;

/// Build the direct-connection URI for one fleet member.
///
/// Credentials are only embedded when the server's designated root user
/// actually carries the `root` role.
pub fn build_uri(server: &ServerDoc, root: Option<&UserDoc>) -> String {
    let auth = match root {
        Some(user) if user.has_role("root") => format!(
            "{}:{}@",
            urlencoding::encode(&user.name),
            urlencoding::encode(&user.password)
        ),
        _ => String::new(),
    };

    let database = server.default_database.as_deref().unwrap_or("");

    format!(
        "mongodb://{}{}:{}/{}?serverSelectionTimeoutMS={}&directConnection=true",
        auth, server.host, server.port, database, SERVER_SELECTION_TIMEOUT_MS
    )
}
