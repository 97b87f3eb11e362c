//! Virtual try-on job orchestration
//!
//! This library provides the job-orchestration core of the try-on service:
//! the job lifecycle policy, the provider registry, the transformation
//! dispatcher that runs one job end to end, and the job watcher that follows
//! a job until it finishes. The HTTP API and the queue worker are thin
//! wiring over these pieces.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
