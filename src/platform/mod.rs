// ABOUTME: Platform abstraction module for krypton
// ABOUTME: Re-exports the connector factory and the optional WhatsApp adapter

pub mod factory;
#[cfg(feature = "whatsapp")]
pub mod whatsapp;

pub use factory::{create_connector, DEFAULT_PLATFORM};

#[cfg(feature = "whatsapp")]
pub use whatsapp::{WhatsAppConnector, WhatsAppTransport};
