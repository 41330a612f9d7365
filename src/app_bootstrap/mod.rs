//! Startup wiring: builds the shared instances and starts every service.

pub mod services;
