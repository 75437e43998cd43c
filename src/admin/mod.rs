//! Operator-facing administration: server introspection and availability,
//! remote users, per-database maintenance

mod databases;
mod servers;
mod users;

pub use databases::{index_name, validate_collection, DatabaseAdmin};
pub use servers::{Inspection, ServerAdmin};
pub use users::{validate_roles, UserAdmin};
