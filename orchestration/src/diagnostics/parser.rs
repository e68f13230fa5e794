//! GCC / linker output parsing and classification
//!
//! Line-oriented: each recognized line yields one diagnostic, everything else
//! (notes, `In function` context, source excerpts, progress text) is dropped.
//! Classification walks a prioritized rule table; first match wins.

use super::{Diagnostic, DiagnosticClass, Severity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

/// `path/file.ino:12:5: error: message` (column optional, Windows drive allowed)
static GCC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>(?:[A-Za-z]:)?[^:\n]+?):(?P<line>\d+)(?::(?P<col>\d+))?:\s+(?P<sev>fatal error|error|warning):\s+(?P<msg>.+?)\s*$",
    )
    .unwrap()
});

/// `...: undefined reference to `symbol'` from ld
static UNDEFINED_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"undefined reference to [`'‘](?P<sym>[^`'’]+)[`'’]").unwrap()
});

/// `collect2: error: ld returned 1 exit status`
static COLLECT2_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^collect2(?:\.exe)?:\s+error:\s+(?P<msg>.+?)\s*$").unwrap());

static MISSING_HEADER_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<header>[\w./+-]+\.(?:h|hpp|hh)):\s+No such file or directory").unwrap()
});

static MISSING_SYMBOL_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(undefined reference to|was not declared in this scope|has not been declared|is not a member of|does not name a type|undeclared|not declared)",
    )
    .unwrap()
});

static TYPE_MISMATCH_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(cannot convert|invalid conversion|no matching function for call|incompatible types?|invalid operands|no match for 'operator|cannot bind|narrowing conversion|conflicting declaration|non-class type|too (?:many|few) arguments)",
    )
    .unwrap()
});

static SYNTAX_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(expected .+ before|expected primary-expression|expected unqualified-id|expected declaration|expected initializer|expected '.'|stray '.+' in program|missing terminating|unterminated|at end of input)",
    )
    .unwrap()
});

/// Prioritized classification table
static RULES: LazyLock<[(&'static Regex, DiagnosticClass); 4]> = LazyLock::new(|| {
    [
        (&*MISSING_HEADER_RULE, DiagnosticClass::MissingHeader),
        (&*MISSING_SYMBOL_RULE, DiagnosticClass::MissingSymbol),
        (&*TYPE_MISMATCH_RULE, DiagnosticClass::TypeMismatch),
        (&*SYNTAX_RULE, DiagnosticClass::Syntax),
    ]
});

/// Classify a message through the rule table
pub fn classify(message: &str) -> DiagnosticClass {
    RULES
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, class)| *class)
        .unwrap_or(DiagnosticClass::Unknown)
}

/// Stable fingerprint of an ordered diagnostic sequence
pub fn fingerprint(diagnostics: &[Diagnostic]) -> String {
    let mut hasher = blake3::Hasher::new();
    for d in diagnostics {
        hasher.update(d.severity.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(d.class.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(d.file.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\x1f");
        hasher.update(d.line.unwrap_or(0).to_le_bytes().as_slice());
        hasher.update(d.column.unwrap_or(0).to_le_bytes().as_slice());
        hasher.update(d.message.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.finalize().to_hex().to_string()
}

/// Parser for Arduino toolchain output
pub struct DiagnosticParser;

impl DiagnosticParser {
    /// Parse raw toolchain output into an ordered, de-duplicated diagnostic list
    pub fn parse(raw_output: &str) -> Vec<Diagnostic> {
        let mut seen: HashSet<Diagnostic> = HashSet::new();
        let mut diagnostics = Vec::new();

        for line in raw_output.lines() {
            if let Some(diag) = Self::parse_line(line.trim_end()) {
                if seen.insert(diag.clone()) {
                    diagnostics.push(diag);
                }
            }
        }

        diagnostics
    }

    fn parse_line(line: &str) -> Option<Diagnostic> {
        // Linker first: ld lines often look like `file.o:(.text+0x1): undefined ...`
        if let Some(caps) = UNDEFINED_REFERENCE.captures(line) {
            let message = format!("undefined reference to `{}'", &caps["sym"]);
            return Some(Diagnostic {
                severity: Severity::Error,
                file: None,
                line: None,
                column: None,
                class: classify(&message),
                message,
                header: None,
            });
        }

        if let Some(caps) = COLLECT2_LINE.captures(line) {
            let message = caps["msg"].to_string();
            return Some(Diagnostic {
                severity: Severity::Error,
                file: None,
                line: None,
                column: None,
                class: classify(&message),
                message,
                header: None,
            });
        }

        let caps = GCC_LINE.captures(line)?;
        let severity = match &caps["sev"] {
            "warning" => Severity::Warning,
            _ => Severity::Error,
        };
        let message = caps["msg"].to_string();
        let class = classify(&message);
        let header = if class == DiagnosticClass::MissingHeader {
            MISSING_HEADER_RULE
                .captures(&message)
                .map(|h| h["header"].to_string())
        } else {
            None
        };

        Some(Diagnostic {
            severity,
            file: Some(caps["file"].trim().to_string()),
            line: caps["line"].parse().ok(),
            column: caps.name("col").and_then(|c| c.as_str().parse().ok()),
            message,
            class,
            header,
        })
    }

    /// Error-severity diagnostics only
    pub fn errors(diagnostics: &[Diagnostic]) -> Vec<&Diagnostic> {
        diagnostics.iter().filter(|d| d.is_error()).collect()
    }

    /// Headers named by `missing-header` diagnostics, in order of appearance
    pub fn missing_headers(diagnostics: &[Diagnostic]) -> Vec<String> {
        let mut headers: Vec<String> = Vec::new();
        for d in diagnostics {
            if let Some(h) = &d.header {
                if d.class.is_dependency_related() && !headers.contains(h) {
                    headers.push(h.clone());
                }
            }
        }
        headers
    }

    /// Group diagnostics by class
    pub fn group_by_class(
        diagnostics: &[Diagnostic],
    ) -> BTreeMap<DiagnosticClass, Vec<&Diagnostic>> {
        let mut groups: BTreeMap<DiagnosticClass, Vec<&Diagnostic>> = BTreeMap::new();
        for d in diagnostics {
            groups.entry(d.class).or_default().push(d);
        }
        groups
    }

    /// Summary statistics
    pub fn summarize(diagnostics: &[Diagnostic]) -> DiagnosticSummary {
        let groups = Self::group_by_class(diagnostics);
        DiagnosticSummary {
            errors: diagnostics.iter().filter(|d| d.is_error()).count(),
            warnings: diagnostics.iter().filter(|d| !d.is_error()).count(),
            by_class: groups.iter().map(|(k, v)| (*k, v.len())).collect(),
            has_missing_headers: groups.contains_key(&DiagnosticClass::MissingHeader),
            has_linker_errors: diagnostics.iter().any(|d| d.is_error() && d.file.is_none()),
        }
    }

    /// Render a diagnostic list for the repair collaborator
    pub fn format_for_repair(diagnostics: &[Diagnostic]) -> String {
        let errors = Self::errors(diagnostics);
        if errors.is_empty() {
            return "No compiler errors.".to_string();
        }
        let lines: Vec<String> = errors.iter().map(|d| d.format_for_repair()).collect();
        format!("Compiler errors ({} total):\n{}", errors.len(), lines.join("\n"))
    }
}

/// Summary of a diagnostic set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub errors: usize,
    pub warnings: usize,
    pub by_class: BTreeMap<DiagnosticClass, usize>,
    pub has_missing_headers: bool,
    pub has_linker_errors: bool,
}

impl std::fmt::Display for DiagnosticSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let classes: Vec<String> = self
            .by_class
            .iter()
            .map(|(class, n)| format!("{class}={n}"))
            .collect();
        write!(
            f,
            "{} error(s), {} warning(s) [{}]",
            self.errors,
            self.warnings,
            classes.join(", ")
        )
    }
}
