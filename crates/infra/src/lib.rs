//! Infrastructure layer: job queue engine, ticket persistence, config.

pub mod clock;
pub mod config;
pub mod db;
pub mod jobs;
pub mod tickets;

#[cfg(test)]
mod integration_tests;
