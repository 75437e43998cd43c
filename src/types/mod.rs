//! Shared types for mongo-fleet

mod error;

pub use error::{FleetError, Result};
