//! apprelay - A gateway that supervises a fleet of small web apps
//!
//! This library provides a single-entry relay that:
//! - Assigns each configured app a local port and launches it on demand
//! - Prepares a Python virtual environment before running python apps
//! - Captures each app's recent output in a bounded line buffer
//! - Caps how many apps may be active at once
//! - Proxies HTTP and WebSocket traffic under `/relay/<app>/...`
//! - Fronts a management UI app under `/management/`

pub mod app;
pub mod config;
pub mod error;
pub mod logbuf;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod scheduler;
pub mod staging;
pub mod supervisor;
