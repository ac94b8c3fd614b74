pub mod breeding;
pub mod catlet_config;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod genepool;
pub mod genes;
pub mod inventory;
pub mod metrics;
pub mod mqtt;
pub mod resolution;
/// Saga engine: typed saga definitions, durable state, event correlation.
pub mod saga;
pub mod sagas;
pub mod specification;

#[cfg(test)]
mod test_support;
