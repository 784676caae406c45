pub mod android;
pub mod traits;

pub use traits::{DeviceDriver, ScreenCapture};

use anyhow::Result;

/// List devices attached over adb
pub async fn list_devices() -> Result<()> {
    android::list_devices().await
}
