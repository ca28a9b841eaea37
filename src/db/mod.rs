//! Database module: connection setup, catalog table layouts and SQL.
//!
//! - `schema`: the column layout of shows, seasons and episodes, and the
//!   projection of raw catalog records onto it.
//! - `repo`: SQL-only functions (pools, migrations, sessions, upserts).
//!
//! External modules should import from `show_sync::db`; the repository API is
//! re-exported here.

pub mod repo;
pub mod schema;

pub use repo::*;
