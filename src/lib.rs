//! Enrich Pipeline: event-driven background enrichment with tiered memory.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod jobs;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod store;
pub mod vector;
pub mod worker;
