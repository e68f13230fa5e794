//! Toolchain diagnostics
//!
//! Converts raw `arduino-cli compile` output (GCC + linker text) into an
//! ordered sequence of classified [`Diagnostic`]s.
//!
//! ```text
//! raw output → DiagnosticParser::parse → [Diagnostic] → FixLoop / repair request
//! ```

pub mod parser;

pub use parser::{fingerprint, DiagnosticParser, DiagnosticSummary};

use serde::{Deserialize, Serialize};

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// Classification tag; the repair strategy differs per class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticClass {
    /// `#include` target not found (usually a missing library)
    MissingHeader,
    /// Undeclared identifier or unresolved linker symbol
    MissingSymbol,
    /// Conversion / overload / operand type errors
    TypeMismatch,
    /// Parse errors
    Syntax,
    /// Anything the rule table does not recognize
    Unknown,
}

impl DiagnosticClass {
    /// Whether a library install (rather than a code change) may fix this
    pub fn is_dependency_related(&self) -> bool {
        matches!(self, Self::MissingHeader)
    }
}

impl std::fmt::Display for DiagnosticClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "missing-header"),
            Self::MissingSymbol => write!(f, "missing-symbol"),
            Self::TypeMismatch => write!(f, "type-mismatch"),
            Self::Syntax => write!(f, "syntax"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One classified compiler/linker message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Source file; None for linker-level errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    pub class: DiagnosticClass,
    /// Header name for `missing-header` diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

impl Diagnostic {
    /// Synthetic diagnostic standing in for a library the resolver could not
    /// install, so the repair collaborator can work around it
    pub fn unresolved_library(name: &str, header: Option<&str>) -> Self {
        let header_name = header.map(String::from);
        let message = match header {
            Some(h) => format!(
                "{h}: No such file or directory (library '{name}' could not be installed)"
            ),
            None => format!("library '{name}' could not be installed"),
        };
        Self {
            severity: Severity::Error,
            file: None,
            line: None,
            column: None,
            message,
            class: DiagnosticClass::MissingHeader,
            header: header_name,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// `file:line:col` with the directory stripped, or `<link>` for linker errors
    pub fn location(&self) -> String {
        match &self.file {
            Some(file) => {
                let short = file.rsplit(['/', '\\']).next().unwrap_or(file);
                match (self.line, self.column) {
                    (Some(l), Some(c)) => format!("{short}:{l}:{c}"),
                    (Some(l), None) => format!("{short}:{l}"),
                    _ => short.to_string(),
                }
            }
            None => "<link>".to_string(),
        }
    }

    /// Format for a repair request
    pub fn format_for_repair(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.class,
            self.location(),
            self.severity,
            self.message
        )
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.location(), self.severity, self.message)
    }
}
