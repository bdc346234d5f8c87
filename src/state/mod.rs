//! SQLite persistence. Each repository module exposes free functions over a `&Connection`,
//! so the same query can run standalone or inside a `StateDatabase::write` transaction.

pub mod db;
pub mod hosts;
pub mod images;
pub mod instances;
pub mod ports;
pub mod reservations;
pub mod tasks;
pub mod traffic;
pub mod users;

pub use db::StateDatabase;

#[cfg(test)]
pub(crate) mod fixtures;
