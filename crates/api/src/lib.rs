//! HTTP API: insight feed reads and operator endpoints.

pub mod app;
