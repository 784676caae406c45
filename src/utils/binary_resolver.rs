use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

/// Candidate locations for adb, in lookup order (PATH excluded)
fn adb_candidates(android_home: Option<PathBuf>, home: Option<PathBuf>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(sdk) = android_home {
        candidates.push(sdk.join("platform-tools").join(adb_file_name()));
    }
    if let Some(home) = home {
        candidates.push(
            home.join(".mut")
                .join("platform-tools")
                .join(adb_file_name()),
        );
    }
    candidates
}

fn resolve_adb() -> Result<PathBuf> {
    let android_home = std::env::var_os("ANDROID_HOME")
        .or_else(|| std::env::var_os("ANDROID_SDK_ROOT"))
        .map(PathBuf::from);
    let candidates = adb_candidates(android_home, dirs::home_dir());

    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }

    if let Ok(path) = which::which("adb") {
        return Ok(path);
    }

    let checked: Vec<String> = candidates
        .iter()
        .map(|p| format!("  {}", p.display()))
        .chain(std::iter::once("  $PATH".to_string()))
        .collect();
    anyhow::bail!(
        "Could not find adb. Install Android platform-tools or set ANDROID_HOME. Checked:\n{}",
        checked.join("\n")
    )
}

/// Locate the adb binary; the result is cached for the process lifetime
pub fn find_adb() -> Result<PathBuf> {
    static ADB: OnceLock<PathBuf> = OnceLock::new();
    if let Some(path) = ADB.get() {
        return Ok(path.clone());
    }
    let path = resolve_adb()?;
    log::debug!("Using adb at {}", path.display());
    Ok(ADB.get_or_init(|| path).clone())
}
