//! Board profiles and the static board catalog
//!
//! A [`BoardProfile`] is the immutable descriptor every compile and upload
//! attempt is parameterized by. Profiles are looked up by display name or by
//! fully qualified board name (FQBN).

use serde::{Deserialize, Serialize};

/// USB identifier a board (or its USB-serial bridge) enumerates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbId {
    /// Vendor ID
    pub vid: u16,
    /// Product ID (None = any product from this vendor)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
}

impl UsbId {
    /// Identifier matching one exact vendor/product pair
    pub const fn exact(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid: Some(pid),
        }
    }

    /// Identifier matching every product of a vendor
    pub const fn vendor(vid: u16) -> Self {
        Self { vid, pid: None }
    }

    /// Check whether a detected vid/pid pair matches this identifier
    pub fn matches(&self, vid: u16, pid: Option<u16>) -> bool {
        if self.vid != vid {
            return false;
        }
        match (self.pid, pid) {
            (None, _) => true,
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
        }
    }
}

/// Static descriptor of a target microcontroller's toolchain parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardProfile {
    /// Display name ("Arduino Uno")
    pub name: String,
    /// Toolchain target string ("arduino:avr:uno")
    pub fqbn: String,
    /// Default serial monitor baud rate
    pub default_baud: u32,
    /// Upload protocols the board accepts, preferred first
    pub upload_protocols: Vec<String>,
    /// Known USB identifiers used to pick plausible ports
    #[serde(default)]
    pub usb_ids: Vec<UsbId>,
}

impl BoardProfile {
    /// Protocol used for uploads (first declared, "serial" when none declared)
    pub fn preferred_protocol(&self) -> &str {
        self.upload_protocols
            .first()
            .map(String::as_str)
            .unwrap_or("serial")
    }

    /// Whether this is an Espressif core (ESP32 / ESP8266)
    pub fn is_espressif(&self) -> bool {
        self.fqbn.starts_with("esp32:") || self.fqbn.starts_with("esp8266:")
    }

    /// Whether the board has known USB identifiers
    pub fn has_usb_ids(&self) -> bool {
        !self.usb_ids.is_empty()
    }

    /// Whether a detected vid/pid pair is plausible for this board
    pub fn matches_usb(&self, vid: u16, pid: Option<u16>) -> bool {
        self.usb_ids.iter().any(|id| id.matches(vid, pid))
    }
}

impl std::fmt::Display for BoardProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.fqbn)
    }
}

const ARDUINO_VID: u16 = 0x2341;
const FTDI: UsbId = UsbId::exact(0x0403, 0x6001);
const CH340: UsbId = UsbId::exact(0x1A86, 0x7523);
const CP210X: UsbId = UsbId::exact(0x10C4, 0xEA60);

fn profile(name: &str, fqbn: &str, baud: u32, usb_ids: &[UsbId]) -> BoardProfile {
    BoardProfile {
        name: name.to_string(),
        fqbn: fqbn.to_string(),
        default_baud: baud,
        upload_protocols: vec!["serial".to_string()],
        usb_ids: usb_ids.to_vec(),
    }
}

/// Catalog of supported boards
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardCatalog {
    boards: Vec<BoardProfile>,
}

impl BoardCatalog {
    /// The built-in "Supported Boards" list
    pub fn builtin() -> Self {
        Self {
            boards: vec![
                profile(
                    "Arduino Uno",
                    "arduino:avr:uno",
                    9600,
                    &[
                        UsbId::exact(ARDUINO_VID, 0x0043),
                        UsbId::exact(ARDUINO_VID, 0x0001),
                        UsbId::exact(ARDUINO_VID, 0x0243),
                    ],
                ),
                profile(
                    "Arduino Mega",
                    "arduino:avr:mega",
                    9600,
                    &[
                        UsbId::exact(ARDUINO_VID, 0x0042),
                        UsbId::exact(ARDUINO_VID, 0x0010),
                    ],
                ),
                profile("Arduino Nano", "arduino:avr:nano", 9600, &[FTDI, CH340]),
                profile(
                    "Arduino Leonardo",
                    "arduino:avr:leonardo",
                    9600,
                    &[
                        UsbId::exact(ARDUINO_VID, 0x8036),
                        UsbId::exact(ARDUINO_VID, 0x0036),
                    ],
                ),
                profile(
                    "Arduino Nano Every",
                    "arduino:megaavr:nanoevery",
                    9600,
                    &[UsbId::exact(ARDUINO_VID, 0x0058)],
                ),
                profile(
                    "Arduino Due",
                    "arduino:sam:due",
                    9600,
                    &[
                        UsbId::exact(ARDUINO_VID, 0x003D),
                        UsbId::exact(ARDUINO_VID, 0x003E),
                    ],
                ),
                profile(
                    "Arduino MKR Zero",
                    "arduino:samd:mkrzero",
                    9600,
                    &[
                        UsbId::exact(ARDUINO_VID, 0x804F),
                        UsbId::exact(ARDUINO_VID, 0x004F),
                    ],
                ),
                profile("ESP32 Dev", "esp32:esp32:esp32", 115200, &[CP210X, CH340]),
                profile(
                    "NodeMCU 1.0 (ESP-12E Module)",
                    "esp8266:esp8266:nodemcuv2",
                    115200,
                    &[CP210X, CH340],
                ),
            ],
        }
    }

    /// Build a catalog from an explicit list
    pub fn from_profiles(boards: Vec<BoardProfile>) -> Self {
        Self { boards }
    }

    /// Add or replace profiles (matched by FQBN)
    pub fn extend(&mut self, extra: impl IntoIterator<Item = BoardProfile>) {
        for board in extra {
            match self.boards.iter_mut().find(|b| b.fqbn == board.fqbn) {
                Some(existing) => *existing = board,
                None => self.boards.push(board),
            }
        }
    }

    /// Look up a board by display name (case-insensitive) or exact FQBN
    pub fn find(&self, key: &str) -> Option<&BoardProfile> {
        let key = key.trim();
        self.boards
            .iter()
            .find(|b| b.fqbn == key)
            .or_else(|| self.boards.iter().find(|b| b.name.eq_ignore_ascii_case(key)))
    }

    /// All boards in catalog order
    pub fn boards(&self) -> &[BoardProfile] {
        &self.boards
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}
