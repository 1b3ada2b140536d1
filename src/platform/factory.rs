// ABOUTME: Platform factory selecting the protocol connector from config
// ABOUTME: Resolves a platform id to a compiled-in Connector or explains how to enable it

use anyhow::Result;
use krypton_core::Connector;
use std::sync::Arc;

use crate::config::Config;

/// Platform used when none is requested explicitly
pub const DEFAULT_PLATFORM: &str = "whatsapp";

/// Create the connector for a platform id
pub fn create_connector(
    #[allow(unused_variables)] config: &Config,
    platform_id: &str,
) -> Result<Arc<dyn Connector>> {
    match platform_id {
        #[cfg(feature = "whatsapp")]
        "whatsapp" => Ok(Arc::new(super::whatsapp::WhatsAppConnector::new(
            &config.session.dir,
        ))),
        #[cfg(not(feature = "whatsapp"))]
        "whatsapp" => {
            anyhow::bail!("WhatsApp support not compiled. Build with --features whatsapp")
        }
        _ => anyhow::bail!("Unknown platform: {}", platform_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krypton_core::testing::test_config;

    #[test]
    fn test_factory_rejects_unknown_platform() {
        let err = create_connector(&test_config(), "telegram").err().unwrap();
        assert!(err.to_string().contains("Unknown platform"));
    }

    #[cfg(not(feature = "whatsapp"))]
    #[test]
    fn test_factory_explains_missing_feature() {
        let err = create_connector(&test_config(), DEFAULT_PLATFORM)
            .err()
            .unwrap();
        assert!(err.to_string().contains("--features whatsapp"));
    }

    #[cfg(feature = "whatsapp")]
    #[test]
    fn test_factory_builds_whatsapp() {
        assert!(create_connector(&test_config(), DEFAULT_PLATFORM).is_ok());
    }
}
