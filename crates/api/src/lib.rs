//! HTTP API and process wiring for the annotation coordinator.

pub mod app;
