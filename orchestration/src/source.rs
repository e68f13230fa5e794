//! Sketch source model and static dependency inference
//!
//! [`SourceUnit`] is the sketch text plus a revision counter; every mutation
//! bumps the revision. [`declared_dependencies`] derives the library set a
//! sketch needs from its `#include <...>` directives.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::board::BoardProfile;

static INCLUDE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*#\s*include\s*<\s*([^>\s]+)\s*>"#).unwrap());

static LIB_ANNOTATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)//\s*@lib\s+([^@\r\n]+?)(?:@([^\s]+))?(?:\s+for\s+<([^>\s]+)>)?\s*$").unwrap()
});

/// Headers shipped with every Arduino core or the C/C++ runtime
const CORE_HEADERS: &[&str] = &[
    "Arduino.h",
    "Wire.h",
    "SPI.h",
    "EEPROM.h",
    "SoftwareSerial.h",
    "HardwareSerial.h",
    "Print.h",
    "Stream.h",
    "WString.h",
    "pins_arduino.h",
    "math.h",
    "stdint.h",
    "stdlib.h",
    "stdio.h",
    "string.h",
    "ctype.h",
    "limits.h",
    "inttypes.h",
    "stdbool.h",
];

/// Header path prefixes that belong to a toolchain rather than a library
const CORE_PREFIXES: &[&str] = &["avr/", "util/", "freertos/", "esp_", "driver/", "sys/"];

/// Headers provided by the Espressif cores
const ESP_CORE_HEADERS: &[&str] = &[
    "WiFi.h",
    "WiFiClient.h",
    "WiFiClientSecure.h",
    "WiFiUdp.h",
    "WebServer.h",
    "HTTPClient.h",
    "ESP8266WiFi.h",
    "ESP8266WebServer.h",
    "ESP8266HTTPClient.h",
    "ESP8266mDNS.h",
    "ESPmDNS.h",
    "Preferences.h",
    "BluetoothSerial.h",
    "SPIFFS.h",
    "LittleFS.h",
    "FS.h",
    "Ticker.h",
    "Update.h",
];

/// Where a revision of the source came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOrigin {
    /// Produced by the code generator
    Generated,
    /// Edited by the user
    UserEdit,
    /// Produced by an accepted fix proposal
    Fix,
}

impl std::fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generated => write!(f, "generated"),
            Self::UserEdit => write!(f, "user_edit"),
            Self::Fix => write!(f, "fix"),
        }
    }
}

/// The sketch text plus a revision counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Sketch name (also the `.ino` stem)
    name: String,
    /// Current sketch text
    text: String,
    /// Revision, starting at 1 for the initial text
    revision: u32,
    /// Origin of the current revision
    origin: SourceOrigin,
    /// Unique per unit; keeps same-named sketches of different sessions apart on disk
    #[serde(default = "new_workspace_id")]
    workspace_id: String,
}

fn new_workspace_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

impl SourceUnit {
    /// Create the first revision of a sketch
    pub fn new(name: impl Into<String>, text: impl Into<String>, origin: SourceOrigin) -> Self {
        Self {
            name: sanitize_sketch_name(&name.into()),
            text: text.into(),
            revision: 1,
            origin,
            workspace_id: new_workspace_id(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn origin(&self) -> SourceOrigin {
        self.origin
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Replace the text, bumping the revision. Returns the new revision.
    pub fn apply(&mut self, text: impl Into<String>, origin: SourceOrigin) -> u32 {
        self.text = text.into();
        self.origin = origin;
        self.revision += 1;
        self.revision
    }

    /// Whether `candidate` is byte-identical to the current text
    /// (trailing whitespace ignored)
    pub fn is_unchanged(&self, candidate: &str) -> bool {
        self.text.trim_end() == candidate.trim_end()
    }

    /// File name the toolchain expects for this sketch
    pub fn file_name(&self) -> String {
        format!("{}.ino", self.name)
    }
}

/// Arduino sketch folders must match the `.ino` stem and contain only
/// letters, digits, `_`, `-` and `.`; never a leading `.`
fn sanitize_sketch_name(raw: &str) -> String {
    let stem = raw.trim().trim_end_matches(".ino");
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "sketch".to_string()
    } else {
        cleaned.to_string()
    }
}

/// A library name plus optional version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    /// Library name as known to the package index
    pub name: String,
    /// Version constraint ("1.4.6"), None = latest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Header the dependency was inferred from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

impl Dependency {
    /// Dependency on the latest version of a named library
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            header: None,
        }
    }

    /// Dependency inferred from an include directive (`DHT.h` → `DHT`)
    pub fn from_header(header: &str) -> Self {
        let file = header.rsplit('/').next().unwrap_or(header);
        let stem = file
            .strip_suffix(".hpp")
            .or_else(|| file.strip_suffix(".h"))
            .unwrap_or(file);
        Self {
            name: stem.to_string(),
            version: None,
            header: Some(header.to_string()),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    /// Install spec understood by the package index ("Name@1.2.3")
    pub fn install_spec(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.name, v),
            None => self.name.clone(),
        }
    }

    /// Identity used to avoid attempting the same dependency twice in a run
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.install_spec())
    }
}

/// Whether a header is provided by the toolchain for this board
pub fn is_core_header(header: &str, board: &BoardProfile) -> bool {
    if CORE_HEADERS.contains(&header) || CORE_PREFIXES.iter().any(|p| header.starts_with(p)) {
        return true;
    }
    board.is_espressif() && ESP_CORE_HEADERS.contains(&header)
}

/// Derive the declared dependency set of a sketch.
///
/// Angle-bracket includes that are not core headers become dependencies;
/// `// @lib Name@version for <Header.h>` annotations override the inferred
/// name for a header or add a dependency outright. Quoted includes are
/// sketch-local tabs and are ignored. Result is sorted and deduplicated.
pub fn declared_dependencies(text: &str, board: &BoardProfile) -> Vec<Dependency> {
    let mut deps: BTreeSet<Dependency> = BTreeSet::new();
    let mut annotated_headers: BTreeSet<String> = BTreeSet::new();
    let mut annotated_names: BTreeSet<String> = BTreeSet::new();

    for caps in LIB_ANNOTATION_PATTERN.captures_iter(text) {
        let name = caps[1].trim().to_string();
        if name.is_empty() {
            continue;
        }
        let mut dep = Dependency::named(name);
        if let Some(v) = caps.get(2) {
            dep = dep.with_version(v.as_str());
        }
        if let Some(h) = caps.get(3) {
            annotated_headers.insert(h.as_str().to_string());
            dep = dep.with_header(h.as_str());
        }
        annotated_names.insert(dep.key());
        deps.insert(dep);
    }

    for caps in INCLUDE_PATTERN.captures_iter(text) {
        let header = &caps[1];
        if is_core_header(header, board) || annotated_headers.contains(header) {
            continue;
        }
        let dep = Dependency::from_header(header);
        if !annotated_names.contains(&dep.key()) {
            deps.insert(dep);
        }
    }

    deps.into_iter().collect()
}
