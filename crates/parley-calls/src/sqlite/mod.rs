//! `SQLite` persistence: pool, migrations, transactional store, repositories.

pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod store;
