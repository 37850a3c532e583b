//! Song Content Analysis Orchestration
//!
//! This library provides the core functionality for the songscreen system:
//! asynchronous analysis of tracks and playlists scheduled across a worker
//! pool, with priority queueing, in-flight deduplication, progress/ETA
//! tracking and a status-polling protocol for clients.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod poller;
pub mod queue;
pub mod routes;
pub mod services;
pub mod store;
pub mod worker;
