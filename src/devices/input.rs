//! USB input devices.

use crate::pool::Keyed;
use serde::{Deserialize, Serialize};

driver_enum! {
    /// Input device model.
    InputKind, "input" {
        /// Absolute pointer.
        Tablet => "usb-tablet",
        /// Keyboard.
        Keyboard => "usb-kbd",
        /// Relative pointer.
        Mouse => "usb-mouse",
    }
}

/// An input device; at most one of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDevice {
    #[serde(rename = "type")]
    kind: InputKind,
}

impl Keyed for InputDevice {
    const KIND: &'static str = "input";

    fn key(&self) -> String {
        self.kind.as_str().to_string()
    }
}

impl InputDevice {
    /// Create an input device of this kind.
    pub fn new(kind: InputKind) -> Self {
        Self { kind }
    }

    /// Device model.
    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Device id.
    pub fn qdev_id(&self) -> String {
        format!("input_{}", self.kind.as_str().replace('-', "_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_key() {
        let kind: InputKind = "usb-tablet".parse().unwrap();
        let dev = InputDevice::new(kind);
        assert_eq!(dev.key(), "usb-tablet");
        assert_eq!(dev.qdev_id(), "input_usb_tablet");
        assert!("ps2-mouse".parse::<InputKind>().is_err());
    }

    #[test]
    fn test_json_shape() {
        let dev = InputDevice::new(InputKind::Keyboard);
        assert_eq!(serde_json::to_string(&dev).unwrap(), r#"{"type":"usb-kbd"}"#);
    }
}
