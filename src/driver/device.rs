//! Simulator device lifecycle: list, create, boot, shutdown, erase
//!
//! Parsing targets the JSON emitted by `simctl list ... --json`.

use super::command;
use super::{with_retry, HostDriver, ACTION_TIMEOUT, CREATE_TIMEOUT};
use crate::error::{Error, Result};
use log::info;
use serde::Deserialize;
use std::collections::HashMap;

/// Simulator state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DeviceState {
    Shutdown,
    Booting,
    Booted,
    #[serde(rename = "Shutting Down")]
    ShuttingDown,
    #[serde(other)]
    Unknown,
}

/// The host's current view of one device. Derived on demand, never persisted.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub udid: String,
    pub name: String,
    pub runtime: String,
    pub device_type: String,
    pub state: DeviceState,
    /// launchd_sim PID, reported while the device is booted
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub identifier: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct DeviceTypeInfo {
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct RawDeviceList {
    devices: HashMap<String, Vec<RawDevice>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDevice {
    udid: String,
    name: String,
    state: DeviceState,
    #[serde(default)]
    device_type_identifier: Option<String>,
    #[serde(default = "default_available")]
    is_available: bool,
    #[serde(default)]
    process_identifier: Option<u32>,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawRuntimeList {
    runtimes: Vec<RawRuntime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRuntime {
    identifier: String,
    name: String,
    version: String,
    #[serde(default = "default_available")]
    is_available: bool,
}

#[derive(Debug, Deserialize)]
struct RawDeviceTypeList {
    devicetypes: Vec<RawDeviceType>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceType {
    identifier: String,
    name: String,
}

/// Parse a `simctl list devices --json` document.
pub fn parse_device_list(json: &str) -> Result<Vec<DeviceInfo>> {
    let raw: RawDeviceList =
        serde_json::from_str(json).map_err(|e| Error::Driver(format!("bad device list: {}", e)))?;

    let mut devices = Vec::new();
    for (runtime, entries) in raw.devices {
        for d in entries {
            if !d.is_available {
                continue;
            }
            devices.push(DeviceInfo {
                udid: d.udid,
                name: d.name,
                runtime: runtime.clone(),
                device_type: d.device_type_identifier.unwrap_or_default(),
                state: d.state,
                pid: d.process_identifier,
            });
        }
    }
    Ok(devices)
}

impl HostDriver {
    /// Enumerate every available simulator on the host.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let out = with_retry("list-devices", || {
            command::run_ok("xcrun", &["simctl", "list", "devices", "--json"], ACTION_TIMEOUT)
        })
        .await?;
        parse_device_list(&out.stdout_str())
    }

    /// Devices currently in the `Booted` state.
    pub async fn list_booted(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.state == DeviceState::Booted)
            .collect())
    }

    pub async fn list_runtimes(&self) -> Result<Vec<RuntimeInfo>> {
        let out = with_retry("list-runtimes", || {
            command::run_ok("xcrun", &["simctl", "list", "runtimes", "--json"], ACTION_TIMEOUT)
        })
        .await?;
        let raw: RawRuntimeList = serde_json::from_str(&out.stdout_str())
            .map_err(|e| Error::Driver(format!("bad runtime list: {}", e)))?;
        Ok(raw
            .runtimes
            .into_iter()
            .filter(|r| r.is_available && r.name.starts_with("iOS"))
            .map(|r| RuntimeInfo {
                identifier: r.identifier,
                name: r.name,
                version: r.version,
            })
            .collect())
    }

    pub async fn list_device_types(&self) -> Result<Vec<DeviceTypeInfo>> {
        let out = with_retry("list-device-types", || {
            command::run_ok(
                "xcrun",
                &["simctl", "list", "devicetypes", "--json"],
                ACTION_TIMEOUT,
            )
        })
        .await?;
        let raw: RawDeviceTypeList = serde_json::from_str(&out.stdout_str())
            .map_err(|e| Error::Driver(format!("bad device type list: {}", e)))?;
        Ok(raw
            .devicetypes
            .into_iter()
            .filter(|t| t.name.starts_with("iPhone") || t.name.starts_with("iPad"))
            .map(|t| DeviceTypeInfo {
                identifier: t.identifier,
                name: t.name,
            })
            .collect())
    }

    /// Create a device for the named type and OS version; returns its UDID.
    pub async fn create_device(&self, device_type: &str, os_version: &str) -> Result<String> {
        let types = self.list_device_types().await?;
        let dt = types
            .iter()
            .find(|t| t.name == device_type)
            .ok_or_else(|| Error::Configuration(format!("unknown device type: {}", device_type)))?;

        let runtimes = self.list_runtimes().await?;
        let rt = runtimes
            .iter()
            .find(|r| r.version == os_version)
            .ok_or_else(|| Error::Configuration(format!("unknown OS version: {}", os_version)))?;

        let name = format!("simbridge-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let out = command::run_ok(
            "xcrun",
            &["simctl", "create", &name, &dt.identifier, &rt.identifier],
            ACTION_TIMEOUT,
        )
        .await?;

        let udid = out.stdout_str().trim().to_string();
        if udid.is_empty() {
            return Err(Error::Driver("simctl create produced no UDID".into()));
        }
        info!("Created device {} ({} / {})", udid, device_type, os_version);
        Ok(udid)
    }

    /// Boot a device and wait until it is usable.
    pub async fn boot(&self, udid: &str) -> Result<()> {
        let out = command::run("xcrun", &["simctl", "boot", udid], ACTION_TIMEOUT).await?;
        if out.status != 0 && !out.stderr.contains("current state: Booted") {
            return Err(Error::Driver(format!(
                "boot {} failed: {}",
                udid,
                out.stderr.trim()
            )));
        }
        // Block until boot completes; this is the long pole of create().
        command::run_ok("xcrun", &["simctl", "bootstatus", udid, "-b"], CREATE_TIMEOUT).await?;
        info!("Device {} booted", udid);
        Ok(())
    }

    pub async fn shutdown(&self, udid: &str) -> Result<()> {
        let out = command::run("xcrun", &["simctl", "shutdown", udid], ACTION_TIMEOUT).await?;
        if out.status != 0 && !out.stderr.contains("current state: Shutdown") {
            return Err(Error::Driver(format!(
                "shutdown {} failed: {}",
                udid,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn erase(&self, udid: &str) -> Result<()> {
        command::run_ok("xcrun", &["simctl", "erase", udid], ACTION_TIMEOUT).await?;
        Ok(())
    }

    /// Remove the device from the host entirely.
    pub async fn delete_device(&self, udid: &str) -> Result<()> {
        command::run_ok("xcrun", &["simctl", "delete", udid], ACTION_TIMEOUT).await?;
        self.forget_device(udid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LIST: &str = r#"{
        "devices": {
            "com.apple.CoreSimulator.SimRuntime.iOS-17-0": [
                {
                    "udid": "AAAA-1111",
                    "name": "iPhone 15 Pro",
                    "state": "Booted",
                    "deviceTypeIdentifier": "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro",
                    "isAvailable": true,
                    "processIdentifier": 4321
                },
                {
                    "udid": "BBBB-2222",
                    "name": "iPhone 14",
                    "state": "Shutdown",
                    "isAvailable": true
                },
                {
                    "udid": "CCCC-3333",
                    "name": "Broken",
                    "state": "Shutdown",
                    "isAvailable": false
                }
            ],
            "com.apple.CoreSimulator.SimRuntime.iOS-16-4": [
                {
                    "udid": "DDDD-4444",
                    "name": "iPad Air",
                    "state": "Shutting Down",
                    "isAvailable": true
                }
            ]
        }
    }"#;

    #[test]
    fn parses_device_list_and_skips_unavailable() {
        let devices = parse_device_list(DEVICE_LIST).unwrap();
        assert_eq!(devices.len(), 3);
        let booted: Vec<_> = devices
            .iter()
            .filter(|d| d.state == DeviceState::Booted)
            .collect();
        assert_eq!(booted.len(), 1);
        assert_eq!(booted[0].udid, "AAAA-1111");
        assert!(booted[0].runtime.contains("iOS-17-0"));
        assert_eq!(booted[0].pid, Some(4321));
        // Shutdown devices report no process.
        let off = devices.iter().find(|d| d.udid == "BBBB-2222").unwrap();
        assert_eq!(off.pid, None);
    }

    #[test]
    fn shutting_down_state_parses() {
        let devices = parse_device_list(DEVICE_LIST).unwrap();
        let ipad = devices.iter().find(|d| d.udid == "DDDD-4444").unwrap();
        assert_eq!(ipad.state, DeviceState::ShuttingDown);
    }

    #[test]
    fn unknown_state_does_not_fail_parsing() {
        let json = r#"{"devices":{"rt":[{"udid":"X","name":"Y","state":"Weird"}]}}"#;
        let devices = parse_device_list(json).unwrap();
        assert_eq!(devices[0].state, DeviceState::Unknown);
    }

    #[test]
    fn malformed_list_is_a_driver_error() {
        let err = parse_device_list("not json").unwrap_err();
        assert_eq!(err.kind(), "host-driver");
    }
}
