//! Device automation input: tap, swipe, hardware buttons, keys, text
//!
//! All calls serialize through the per-UDID mutex with a 2 s busy deadline;
//! input is fail-fast by design and never queues.

use super::{command, HostDriver, ACTION_TIMEOUT};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hardware buttons the control channel can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HardwareButton {
    Home,
    Lock,
    Siri,
    SideButton,
    ApplePay,
    VolumeUp,
    VolumeDown,
    Shake,
}

impl HardwareButton {
    /// Name the companion tool expects.
    pub fn as_driver_arg(&self) -> &'static str {
        match self {
            HardwareButton::Home => "HOME",
            HardwareButton::Lock => "LOCK",
            HardwareButton::Siri => "SIRI",
            HardwareButton::SideButton => "SIDE_BUTTON",
            HardwareButton::ApplePay => "APPLE_PAY",
            HardwareButton::VolumeUp => "VOLUME_UP",
            HardwareButton::VolumeDown => "VOLUME_DOWN",
            HardwareButton::Shake => "SHAKE",
        }
    }
}

impl HostDriver {
    /// Tap at logical point coordinates.
    pub async fn tap(&self, udid: &str, x: f64, y: f64) -> Result<()> {
        if x < 0.0 || y < 0.0 {
            return Err(Error::Protocol(format!("tap out of bounds: ({}, {})", x, y)));
        }
        let _guard = self.lock_device(udid).await?;
        let (xs, ys) = (fmt_coord(x), fmt_coord(y));
        command::run_ok(
            "idb",
            &["ui", "tap", &xs, &ys, "--udid", udid],
            ACTION_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Swipe between two logical points over an optional duration in seconds.
    pub async fn swipe(
        &self,
        udid: &str,
        start_x: f64,
        start_y: f64,
        end_x: f64,
        end_y: f64,
        duration: Option<f64>,
    ) -> Result<()> {
        if [start_x, start_y, end_x, end_y].iter().any(|v| *v < 0.0) {
            return Err(Error::Protocol("swipe out of bounds".into()));
        }
        let _guard = self.lock_device(udid).await?;
        let coords = [
            fmt_coord(start_x),
            fmt_coord(start_y),
            fmt_coord(end_x),
            fmt_coord(end_y),
        ];
        let dur = duration.map(|d| format!("{:.3}", d.max(0.0)));
        let mut args = vec![
            "ui",
            "swipe",
            &coords[0],
            &coords[1],
            &coords[2],
            &coords[3],
        ];
        if let Some(ref dur) = dur {
            args.push("--duration");
            args.push(dur);
        }
        args.push("--udid");
        args.push(udid);
        command::run_ok("idb", &args, ACTION_TIMEOUT).await?;
        Ok(())
    }

    /// Press a hardware button.
    pub async fn press_button(&self, udid: &str, button: HardwareButton) -> Result<()> {
        let _guard = self.lock_device(udid).await?;
        command::run_ok(
            "idb",
            &["ui", "button", button.as_driver_arg(), "--udid", udid],
            ACTION_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Press a single key by HID usage code, held for an optional duration.
    pub async fn press_key(&self, udid: &str, key: &str, duration: Option<f64>) -> Result<()> {
        if key.is_empty() || key.parse::<u32>().is_err() {
            return Err(Error::Protocol(format!("invalid key code: {:?}", key)));
        }
        let _guard = self.lock_device(udid).await?;
        let dur = duration.map(|d| format!("{:.3}", d.max(0.0)));
        let mut args = vec!["ui", "key", key];
        if let Some(ref dur) = dur {
            args.push("--duration");
            args.push(dur);
        }
        args.push("--udid");
        args.push(udid);
        command::run_ok("idb", &args, ACTION_TIMEOUT).await?;
        Ok(())
    }

    /// Type a text string.
    pub async fn input_text(&self, udid: &str, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let _guard = self.lock_device(udid).await?;
        command::run_ok("idb", &["ui", "text", text, "--udid", udid], ACTION_TIMEOUT).await?;
        Ok(())
    }
}

fn fmt_coord(v: f64) -> String {
    format!("{:.1}", v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_names_match_driver_vocabulary() {
        assert_eq!(HardwareButton::Home.as_driver_arg(), "HOME");
        assert_eq!(HardwareButton::SideButton.as_driver_arg(), "SIDE_BUTTON");
        assert_eq!(HardwareButton::ApplePay.as_driver_arg(), "APPLE_PAY");
    }

    #[test]
    fn button_deserializes_from_kebab_case() {
        let b: HardwareButton = serde_json::from_str("\"volume-up\"").unwrap();
        assert_eq!(b, HardwareButton::VolumeUp);
        assert!(serde_json::from_str::<HardwareButton>("\"eject\"").is_err());
    }

    #[tokio::test]
    async fn negative_coordinates_are_rejected() {
        let driver = HostDriver::new();
        let err = driver.tap("UDID", -1.0, 5.0).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[tokio::test]
    async fn bad_key_code_is_rejected() {
        let driver = HostDriver::new();
        let err = driver.press_key("UDID", "enter", None).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
