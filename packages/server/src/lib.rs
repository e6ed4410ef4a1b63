// Sitewatch - web-security monitoring control plane
//
// This crate is the job orchestration core: a persistent Postgres job queue,
// a replica-safe interval scheduler, the rules evaluation pipeline with its
// cache hierarchy, and the asynchronous alert dispatcher. External workers
// (headless browser, HTTP sink) consume the jobs this core produces.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::Config;
