// ABOUTME: Holds the latest pairing QR code rendered as PNG for the HTTP read path
// ABOUTME: Last write wins, no history; reaching Open invalidates the stored image

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One rendered pairing image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    /// PNG bytes
    pub png: Vec<u8>,
    pub emitted_at: DateTime<Utc>,
}

impl QrPayload {
    pub const CONTENT_TYPE: &'static str = "image/png";
}

/// Render arbitrary data as a QR code PNG
pub fn render_png(data: &[u8]) -> Result<Vec<u8>> {
    let code = QrCode::new(data).context("Failed to encode QR code")?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(256, 256)
        .quiet_zone(true)
        .build();

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("Failed to encode QR code as PNG")?;
    Ok(png)
}

/// Single-slot store for the current pairing image.
///
/// The slot holds an `Arc` that is replaced whole, so readers see either the
/// previous payload or the new one, never a mix.
#[derive(Debug, Default)]
pub struct QrBridge {
    current: RwLock<Option<Arc<QrPayload>>>,
}

impl QrBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a pairing string and make it the current payload
    pub async fn publish(&self, code: &str) -> Result<Arc<QrPayload>> {
        let payload = Arc::new(QrPayload {
            png: render_png(code.as_bytes())?,
            emitted_at: Utc::now(),
        });
        *self.current.write().await = Some(Arc::clone(&payload));
        tracing::info!(bytes = payload.png.len(), "Pairing QR code updated");
        Ok(payload)
    }

    /// Latest payload, if any is valid
    pub async fn current(&self) -> Option<Arc<QrPayload>> {
        self.current.read().await.clone()
    }

    /// Drop the stored payload (after pairing succeeds)
    pub async fn invalidate(&self) {
        if self.current.write().await.take().is_some() {
            tracing::debug!("Pairing QR code invalidated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_render_png_produces_png() {
        let png = render_png(b"2@abcdef,ghijk,lmnop").unwrap();
        assert_eq!(&png[..8], &PNG_MAGIC);
    }

    #[tokio::test]
    async fn test_empty_until_published() {
        let bridge = QrBridge::new();
        assert!(bridge.current().await.is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let bridge = QrBridge::new();
        let mut last = None;
        for i in 0..5 {
            last = Some(bridge.publish(&format!("2@code-{}", i)).await.unwrap());
        }
        let current = bridge.current().await.unwrap();
        assert_eq!(current.png, last.unwrap().png);
        assert_eq!(current.png, render_png(b"2@code-4").unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_clears_payload() {
        let bridge = QrBridge::new();
        bridge.publish("2@code").await.unwrap();
        bridge.invalidate().await;
        assert!(bridge.current().await.is_none());
        // Invalidating an empty bridge is harmless
        bridge.invalidate().await;
    }
}
