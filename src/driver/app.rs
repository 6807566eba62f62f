//! App lifecycle: install (with simulator-compatibility preprocessing),
//! launch, terminate, uninstall
//!
//! Install preprocessing never touches the caller's archive: the archive is
//! expanded into a scratch directory, signing blobs are stripped there, the
//! bundle's supported-platforms metadata is rewritten, and the scratch
//! directory is removed on every exit path.

use super::{command, HostDriver, ACTION_TIMEOUT, CREATE_TIMEOUT};
use crate::error::{Error, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

/// Metadata recorded on the session after a successful install.
#[derive(Debug, Clone)]
pub struct InstalledAppInfo {
    pub bundle_id: String,
    pub name: String,
}

impl HostDriver {
    /// Install an `.ipa`/`.zip` archive (or a bare `.app` directory) onto
    /// the device. Returns the installed bundle identifier.
    pub async fn install_app(&self, udid: &str, archive: &Path) -> Result<InstalledAppInfo> {
        // Scratch dir is dropped (and deleted) on success and on error.
        let scratch = tempfile::Builder::new().prefix("simbridge-install-").tempdir()?;

        let app_dir = if archive.extension().map(|e| e == "app").unwrap_or(false) {
            archive.to_path_buf()
        } else {
            let expanded = scratch.path().join("expanded");
            std::fs::create_dir_all(&expanded)?;
            let archive_s = archive.to_string_lossy().into_owned();
            let expanded_s = expanded.to_string_lossy().into_owned();
            command::run_ok("ditto", &["-x", "-k", &archive_s, &expanded_s], ACTION_TIMEOUT)
                .await
                .map_err(|e| Error::Driver(format!("archive expansion failed: {}", e)))?;
            find_app_bundle(&expanded)
                .ok_or_else(|| Error::Driver("no .app bundle in archive".into()))?
        };

        prepare_bundle_for_simulator(&app_dir).await?;

        let info_plist = app_dir.join("Info.plist");
        let bundle_id = plist_string(&info_plist, "CFBundleIdentifier").await?;
        let name = plist_string(&info_plist, "CFBundleName")
            .await
            .unwrap_or_else(|_| bundle_id.clone());

        let app_s = app_dir.to_string_lossy().into_owned();
        command::run_ok("xcrun", &["simctl", "install", udid, &app_s], CREATE_TIMEOUT).await?;

        info!("Installed {} ({}) on {}", bundle_id, name, udid);
        Ok(InstalledAppInfo { bundle_id, name })
    }

    /// Launch an installed app; returns its PID.
    pub async fn launch_app(&self, udid: &str, bundle_id: &str) -> Result<u32> {
        let out = command::run("xcrun", &["simctl", "launch", udid, bundle_id], ACTION_TIMEOUT).await?;
        if out.status != 0 {
            if out.stderr.contains("not installed") || out.stderr.contains("Unable to find") {
                return Err(Error::NotFound(format!("app not installed: {}", bundle_id)));
            }
            return Err(Error::Driver(format!(
                "launch {} failed: {}",
                bundle_id,
                out.stderr.trim()
            )));
        }
        parse_launch_pid(&out.stdout_str())
            .ok_or_else(|| Error::Driver("launch produced no PID".into()))
    }

    pub async fn terminate_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        let out =
            command::run("xcrun", &["simctl", "terminate", udid, bundle_id], ACTION_TIMEOUT).await?;
        if out.status != 0 && !out.stderr.contains("found nothing to terminate") {
            return Err(Error::Driver(format!(
                "terminate {} failed: {}",
                bundle_id,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn uninstall_app(&self, udid: &str, bundle_id: &str) -> Result<()> {
        let out =
            command::run("xcrun", &["simctl", "uninstall", udid, bundle_id], ACTION_TIMEOUT).await?;
        if out.status != 0 {
            if out.stderr.contains("not installed") {
                return Err(Error::NotFound(format!("app not installed: {}", bundle_id)));
            }
            return Err(Error::Driver(format!(
                "uninstall {} failed: {}",
                bundle_id,
                out.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Strip signing artifacts and mark the bundle as simulator-capable.
async fn prepare_bundle_for_simulator(app_dir: &Path) -> Result<()> {
    strip_signing_artifacts(app_dir)?;

    let info_plist = app_dir.join("Info.plist");
    if !info_plist.exists() {
        return Err(Error::Driver("bundle has no Info.plist".into()));
    }
    let plist_s = info_plist.to_string_lossy().into_owned();
    command::run_ok(
        "plutil",
        &[
            "-replace",
            "CFBundleSupportedPlatforms",
            "-json",
            r#"["iPhoneSimulator"]"#,
            &plist_s,
        ],
        ACTION_TIMEOUT,
    )
    .await?;
    Ok(())
}

/// Recursively remove `_CodeSignature` directories and embedded provisioning
/// profiles from the expanded bundle copy.
fn strip_signing_artifacts(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        if path.is_dir() {
            if name == "_CodeSignature" {
                debug!("stripping {:?}", path);
                std::fs::remove_dir_all(&path)?;
            } else {
                strip_signing_artifacts(&path)?;
            }
        } else if name == "embedded.mobileprovision" {
            debug!("stripping {:?}", path);
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Locate the `.app` directory inside an expanded archive. IPA archives nest
/// it under `Payload/`.
fn find_app_bundle(expanded: &Path) -> Option<PathBuf> {
    for root in [expanded.to_path_buf(), expanded.join("Payload")] {
        let entries = std::fs::read_dir(&root).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.extension().map(|e| e == "app").unwrap_or(false) {
                return Some(path);
            }
        }
    }
    None
}

async fn plist_string(plist: &Path, key: &str) -> Result<String> {
    let plist_s = plist.to_string_lossy().into_owned();
    let out = command::run_ok(
        "plutil",
        &["-extract", key, "raw", "-o", "-", &plist_s],
        ACTION_TIMEOUT,
    )
    .await?;
    let value = out.stdout_str().trim().to_string();
    if value.is_empty() {
        return Err(Error::Driver(format!("Info.plist missing {}", key)));
    }
    Ok(value)
}

/// Parse `simctl launch` stdout of the form `com.example.app: 12345`.
pub fn parse_launch_pid(stdout: &str) -> Option<u32> {
    stdout.trim().rsplit(':').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_launch_pid() {
        assert_eq!(parse_launch_pid("com.example.app: 4242\n"), Some(4242));
        assert_eq!(parse_launch_pid("garbage"), None);
    }

    #[test]
    fn finds_app_bundle_under_payload() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Payload").join("Demo.app");
        std::fs::create_dir_all(&app).unwrap();
        assert_eq!(find_app_bundle(dir.path()), Some(app));
    }

    #[test]
    fn finds_app_bundle_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        std::fs::create_dir_all(&app).unwrap();
        assert_eq!(find_app_bundle(dir.path()), Some(app));
    }

    #[test]
    fn strips_signature_dirs_and_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        std::fs::create_dir_all(app.join("_CodeSignature")).unwrap();
        std::fs::create_dir_all(app.join("Frameworks/Lib.framework/_CodeSignature")).unwrap();
        std::fs::write(app.join("embedded.mobileprovision"), b"blob").unwrap();
        std::fs::write(app.join("binary"), b"data").unwrap();

        strip_signing_artifacts(dir.path()).unwrap();

        assert!(!app.join("_CodeSignature").exists());
        assert!(!app.join("Frameworks/Lib.framework/_CodeSignature").exists());
        assert!(!app.join("embedded.mobileprovision").exists());
        assert!(app.join("binary").exists());
    }
}
