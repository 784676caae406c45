pub mod adb;
pub mod driver;
pub mod uiautomator;

pub use driver::AndroidDriver;

use anyhow::Result;
use colored::Colorize;

/// Print attached devices; only `device` entries are usable for a run
pub async fn list_devices() -> Result<()> {
    let devices = adb::get_devices().await?;

    if devices.is_empty() {
        println!("  No Android devices connected");
        return Ok(());
    }

    let ready = devices.iter().filter(|d| d.state == "device").count();
    println!("  {} device(s), {} ready:", devices.len(), ready);
    for device in &devices {
        let state = if device.state == "device" {
            device.state.green()
        } else {
            device.state.yellow()
        };
        println!("    • {} ({})", device.serial.white().bold(), state);
    }

    Ok(())
}
