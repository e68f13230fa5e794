//! Repair collaborator seam
//!
//! The repair collaborator is an untrusted external function: it receives
//! the current source plus diagnostics and returns a proposal that the
//! controller may accept or discard.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board::BoardProfile;
use crate::diagnostics::{Diagnostic, DiagnosticParser};

/// Everything the collaborator gets to see for one repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub sketch_name: String,
    /// Full text of the revision that failed
    pub source: String,
    pub revision: u32,
    /// Ordered diagnostics of the failed attempt
    pub diagnostics: Vec<Diagnostic>,
    pub board: BoardProfile,
    /// Compile attempt within the current run
    pub attempt: u32,
}

impl RepairRequest {
    /// Diagnostics formatted one per line for a prompt
    pub fn diagnostics_text(&self) -> String {
        DiagnosticParser::format_for_repair(&self.diagnostics)
    }
}

/// Revised source returned by the collaborator, consumed once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixProposal {
    pub source: String,
    pub rationale: String,
}

impl FixProposal {
    pub fn new(source: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            rationale: rationale.into(),
        }
    }

    /// Build a proposal from free-form model output.
    ///
    /// The first `RATIONALE:` line becomes the rationale. When the text
    /// contains a fenced code block, the first block is the source;
    /// otherwise the remaining text is.
    pub fn from_response(text: &str) -> Self {
        let mut rationale = String::new();
        let mut kept = Vec::new();
        let mut in_fence = false;
        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") {
                in_fence = !in_fence;
            }
            if !in_fence && rationale.is_empty() {
                if let Some(rest) = trimmed.strip_prefix("RATIONALE:") {
                    rationale = rest.trim().to_string();
                    continue;
                }
            }
            kept.push(line);
        }
        let body = kept.join("\n");
        Self {
            source: strip_code_fences(&body),
            rationale,
        }
    }

    /// Empty or whitespace-only source
    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }
}

/// Content of the first fenced block, or the trimmed text when unfenced
pub fn strip_code_fences(text: &str) -> String {
    let mut lines = text.lines();
    let mut block = Vec::new();
    let mut found = false;
    for line in lines.by_ref() {
        if line.trim_start().starts_with("```") {
            found = true;
            break;
        }
    }
    if !found {
        return text.trim().to_string();
    }
    for line in lines {
        if line.trim_start().starts_with("```") {
            break;
        }
        block.push(line);
    }
    let mut out = block.join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepairError {
    #[error("repair service unavailable: {0}")]
    Unavailable(String),

    #[error("repair service returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("repair timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// External function that proposes source fixes
#[async_trait]
pub trait RepairCollaborator: Send + Sync {
    async fn propose(&self, request: &RepairRequest) -> Result<FixProposal, RepairError>;
}
