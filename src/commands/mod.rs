// ABOUTME: Compiled-in command catalog for the bot
// ABOUTME: Registers the built-in commands grouped by category

mod generate_qr;
mod help;

pub use generate_qr::{GenerateQr, MISSING_SESSION_MESSAGE};
pub use help::Help;

use krypton_core::CommandCatalog;

/// Every command the bot ships with. The session reloads this on each open.
pub fn catalog() -> CommandCatalog {
    CommandCatalog::new().with(GenerateQr::new()).with(Help::new())
}
