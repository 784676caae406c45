use super::adb;
use super::uiautomator;
use crate::driver::traits::{DeviceDriver, ScreenCapture};
use anyhow::{Context, Result};
use async_trait::async_trait;

/// Android device driven through adb
pub struct AndroidDriver {
    serial: Option<String>,
}

impl AndroidDriver {
    /// Connect to `serial`, or to the only attached device when none is given
    pub async fn new(serial: Option<&str>) -> Result<Self> {
        let selected = match serial {
            Some(s) => s.to_string(),
            None => {
                let devices: Vec<_> = adb::get_devices()
                    .await?
                    .into_iter()
                    .filter(|d| d.state == "device")
                    .collect();
                match devices.as_slice() {
                    [] => anyhow::bail!("No Android devices connected"),
                    [only] => only.serial.clone(),
                    _ => anyhow::bail!(
                        "Multiple devices connected. Please specify one with --device"
                    ),
                }
            }
        };

        log::info!("Using Android device {}", selected);
        Ok(Self {
            serial: Some(selected),
        })
    }

    async fn shell(&self, cmd: &str) -> Result<String> {
        adb::shell(self.serial.as_deref(), cmd).await
    }

    async fn dump_hierarchy(&self) -> Result<Vec<uiautomator::UiElement>> {
        let raw = adb::exec_out_binary(self.serial.as_deref(), "uiautomator dump /dev/stdout")
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string());

        let xml = match raw {
            Ok(output) if output.contains("<?xml") => output,
            _ => {
                // Older Android versions cannot dump to stdout
                self.shell(
                    "uiautomator dump /sdcard/window_dump.xml > /dev/null && cat /sdcard/window_dump.xml",
                )
                .await?
            }
        };

        // The stdout dump is followed by a status line
        let start = xml.find("<?xml").unwrap_or(0);
        let end = xml
            .rfind("</hierarchy>")
            .map(|i| i + "</hierarchy>".len())
            .filter(|end| *end > start)
            .unwrap_or(xml.len());
        let xml = &xml[start..end];

        uiautomator::parse_hierarchy(xml).context("Failed to parse UI hierarchy")
    }
}

/// Escape text for `input text`
fn escape_input_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => escaped.push_str("%s"),
            '\\' | '"' | '\'' | '&' | '<' | '>' | '|' | ';' | '(' | ')' | '$' | '`' | '*'
            | '~' | '#' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Map a key name to an Android keycode
fn keycode(key: &str) -> Result<String> {
    let name = key.trim().to_lowercase();
    let code = match name.as_str() {
        "home" => "3",
        "back" => "4",
        "search" => "84",
        "enter" | "done" => "66",
        "power" => "26",
        "volume_up" => "24",
        "volume_down" => "25",
        "menu" => "82",
        "tab" => "61",
        "space" => "62",
        "del" | "delete" | "backspace" => "67",
        "escape" | "esc" => "111",
        "dpad_up" | "up" => "19",
        "dpad_down" | "down" => "20",
        "dpad_left" | "left" => "21",
        "dpad_right" | "right" => "22",
        "dpad_center" | "center" => "23",
        s if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => s,
        _ => anyhow::bail!("Unsupported key: {}. Use a raw keycode (e.g. '66')", key),
    };
    Ok(code.to_string())
}

#[async_trait]
impl DeviceDriver for AndroidDriver {
    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    async fn tap(&self, x: i32, y: i32) -> Result<()> {
        self.shell(&format!("input tap {} {}", x, y)).await?;
        Ok(())
    }

    async fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64) -> Result<()> {
        self.shell(&format!(
            "input swipe {} {} {} {} {}",
            x1, y1, x2, y2, duration_ms
        ))
        .await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.shell(&format!("input text \"{}\"", escape_input_text(text)))
            .await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let code = keycode(key)?;
        self.shell(&format!("input keyevent {}", code)).await?;
        Ok(())
    }

    async fn launch_app(&self, app_id: &str) -> Result<()> {
        let output = self
            .shell(&format!(
                "monkey -p {} -c android.intent.category.LAUNCHER 1",
                app_id
            ))
            .await
            .with_context(|| format!("Failed to launch {}", app_id))?;

        if output.contains("No activities found") {
            anyhow::bail!("No launchable activity found for {}", app_id);
        }
        Ok(())
    }

    async fn terminate_app(&self, app_id: &str) -> Result<()> {
        self.shell(&format!("am force-stop {}", app_id)).await?;
        Ok(())
    }

    async fn find_element_by_text(&self, text: &str) -> Result<Option<(i32, i32)>> {
        let elements = self.dump_hierarchy().await?;
        Ok(uiautomator::find_by_text(&elements, text).map(|e| e.bounds.center()))
    }

    async fn screen_size(&self) -> Result<(u32, u32)> {
        adb::get_screen_size(self.serial.as_deref()).await
    }
}

#[async_trait]
impl ScreenCapture for AndroidDriver {
    async fn screenshot(&self) -> Result<Vec<u8>> {
        let png = adb::exec_out_binary(self.serial.as_deref(), "screencap -p").await?;
        if !png.starts_with(b"\x89PNG") {
            anyhow::bail!("screencap returned {} bytes of non-PNG data", png.len());
        }
        Ok(png)
    }
}
