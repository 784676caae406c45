use crate::utils::binary_resolver;
use anyhow::{Context, Result};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// A device line from `adb devices`
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub serial: String,
    pub state: String,
}

async fn run(serial: Option<&str>, args: &[&str]) -> Result<Output> {
    let mut full_args: Vec<&str> = Vec::with_capacity(args.len() + 2);
    if let Some(s) = serial {
        full_args.push("-s");
        full_args.push(s);
    }
    full_args.extend_from_slice(args);

    let adb_path = binary_resolver::find_adb()?;
    Command::new(adb_path)
        .args(&full_args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to execute: adb {}", full_args.join(" ")))
}

/// Get list of connected Android devices
pub async fn get_devices() -> Result<Vec<Device>> {
    let output = run(None, &["devices"]).await?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        log::debug!("adb devices stderr: {}", stderr.trim());
    }

    Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_devices(stdout: &str) -> Vec<Device> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some(state)) => Some(Device {
                    serial: serial.to_string(),
                    state: state.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Execute an ADB shell command
pub async fn shell(serial: Option<&str>, cmd: &str) -> Result<String> {
    let output = run(serial, &["shell", cmd]).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ADB shell command failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Execute `adb exec-out` and return raw bytes (screenshots)
pub async fn exec_out_binary(serial: Option<&str>, cmd: &str) -> Result<Vec<u8>> {
    let output = run(serial, &["exec-out", cmd]).await?;

    // exec-out may not set exit status properly, check if we got output
    if output.stdout.is_empty() && !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ADB exec-out command failed: {}", stderr.trim());
    }

    Ok(output.stdout)
}

/// Get screen resolution (handles rotation)
pub async fn get_screen_size(serial: Option<&str>) -> Result<(u32, u32)> {
    let output = shell(serial, "wm size").await?;
    let (width, height) = parse_wm_size(&output)
        .ok_or_else(|| anyhow::anyhow!("Unexpected 'wm size' output: {}", output.trim()))?;

    // mRotation=1 (90°) or mRotation=3 (270°) means landscape
    let rotation_output = shell(serial, "dumpsys window displays | grep mRotation")
        .await
        .unwrap_or_default();
    let is_landscape =
        rotation_output.contains("mRotation=1") || rotation_output.contains("mRotation=3");

    if is_landscape && height > width {
        Ok((height, width))
    } else {
        Ok((width, height))
    }
}

/// Parse `wm size` output, preferring an override size over the physical one
fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let parse_line = |prefix: &str| {
        output.lines().find_map(|line| {
            let size = line.trim().strip_prefix(prefix)?.trim();
            let (w, h) = size.split_once('x')?;
            Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
        })
    };
    parse_line("Override size:").or_else(|| parse_line("Physical size:"))
}
