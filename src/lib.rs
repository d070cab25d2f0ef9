//! Turnstile - Per-Client Admission Control
//!
//! This crate implements an in-memory, single-process sliding-window rate
//! limiter. Each [`ratelimit::AdmissionController`] enforces one policy
//! ("10 requests / 15 minutes") per client key while keeping both the number
//! of tracked clients and the history kept per client bounded.

pub mod config;
pub mod error;
pub mod ratelimit;
