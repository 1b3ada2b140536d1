// ABOUTME: Root library module for the krypton bot binary
// ABOUTME: Wires the built-in commands, handlers, platform adapters and HTTP server onto krypton-core

pub mod commands;
pub mod handlers;
pub mod logging;
pub mod platform;
pub mod server;

// Re-export platform-agnostic modules from krypton-core
pub use krypton_core::config;
pub use krypton_core::credentials;
pub use krypton_core::paths;
pub use krypton_core::session;
pub use krypton_core::traits;
