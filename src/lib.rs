//! Multicon - one query interface over Redshift, BigQuery and Databricks.
//!
//! A [`session::Session`] is built from a named profile, optionally tunnels
//! through an SSH bastion, and returns results as [`backend::Table`]s.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod magic;
pub mod session;
pub mod tunnel;
