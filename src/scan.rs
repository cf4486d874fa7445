use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::debug;

use crate::error::{Error, Result};

/// For testing and encapsulation: if this environment variable names a
/// JSON file in `{"port-name": {"attr": "value", ...}, ...}` format, the
/// [`SystemScanner`] returns that listing instead of real scan results.
pub const SCAN_OVERRIDE_ENV: &str = "SERIAL_TETHER_SCAN_OVERRIDE";

/// What we know about a potentially available serial device on the
/// system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedPort {
    /// The OS device identifier, eg. `/dev/ttyUSB3` or `COM4`.
    pub name: String,

    /// Descriptive attributes, lowercased keys (eg. `vid_pid`,
    /// `serial_number`, `product`).
    pub attrs: BTreeMap<String, String>,
}

impl Display for ScannedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Something which can enumerate the serial devices currently attached.
///
/// Must be safely callable repeatedly; results are sorted by device name
/// so repeated scans are deterministic.
pub trait PortScanner: Send {
    /// Returns the devices currently attached.
    fn scan(&mut self) -> Result<Vec<ScannedPort>>;
}

/// Scanner backed by the operating system's device enumeration
/// (honors [`SCAN_OVERRIDE_ENV`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScanner;

impl PortScanner for SystemScanner {
    fn scan(&mut self) -> Result<Vec<ScannedPort>> {
        if let Ok(path) = std::env::var(SCAN_OVERRIDE_ENV) {
            let text = fs::read_to_string(&path)
                .map_err(|e| Error::ScanFailed(format!("can't read {SCAN_OVERRIDE_ENV} {path}: {e}")))?;
            let ports = ports_from_json(&text)
                .map_err(|e| Error::ScanFailed(format!("bad {SCAN_OVERRIDE_ENV} {path}: {e}")))?;

            debug!(%path, "read scan override");
            return Ok(ports);
        }

        let found =
            serialport::available_ports().map_err(|e| Error::ScanFailed(e.to_string()))?;

        let mut out: Vec<ScannedPort> = found.into_iter().map(scanned_from_info).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(found = out.len(), "scanned serial ports");
        Ok(out)
    }
}

fn scanned_from_info(info: serialport::SerialPortInfo) -> ScannedPort {
    let mut attrs = BTreeMap::new();
    attrs.insert("device".to_string(), info.port_name.clone());

    match info.port_type {
        SerialPortType::UsbPort(usb) => {
            attrs.insert("type".into(), "usb".into());
            attrs.insert("vid".into(), format!("{:04x}", usb.vid));
            attrs.insert("pid".into(), format!("{:04x}", usb.pid));
            attrs.insert("vid_pid".into(), format!("{:04x}:{:04x}", usb.vid, usb.pid));
            for (key, value) in [
                ("serial_number", usb.serial_number),
                ("manufacturer", usb.manufacturer),
                ("product", usb.product),
            ] {
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    attrs.insert(key.into(), value);
                }
            }
        }
        SerialPortType::BluetoothPort => {
            attrs.insert("type".into(), "bluetooth".into());
        }
        SerialPortType::PciPort => {
            attrs.insert("type".into(), "pci".into());
        }
        SerialPortType::Unknown => {}
    }

    ScannedPort {
        name: info.port_name,
        attrs,
    }
}

/// Parses a scan override listing; ports come back sorted by name.
fn ports_from_json(text: &str) -> serde_json::Result<Vec<ScannedPort>> {
    let listing: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(text)?;

    Ok(listing
        .into_iter()
        .map(|(name, attrs)| ScannedPort { name, attrs })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_listing_parses() {
        let ports = ports_from_json(
            r#"{"/dev/ttyUSB1": {"product": "Tigard"}, "/dev/ttyUSB0": {}}"#,
        )
        .unwrap();

        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name, "/dev/ttyUSB0");
        assert_eq!(ports[1].name, "/dev/ttyUSB1");
        assert_eq!(ports[1].attrs["product"], "Tigard");
    }

    #[test]
    fn override_listing_rejects_bad_shapes() {
        assert!(ports_from_json(r#"["/dev/ttyUSB0"]"#).is_err());
        assert!(ports_from_json(r#"{"/dev/ttyUSB0": {"vid": 1027}}"#).is_err());
        assert!(ports_from_json("not json").is_err());
    }
}
