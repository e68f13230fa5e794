//! HTTP repair collaborator for OpenAI-compatible chat endpoints

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use orchestration::fix_loop::{FixProposal, RepairCollaborator, RepairError, RepairRequest};

const SYSTEM_PROMPT: &str = "You repair Arduino sketches that fail to compile. \
Fix only the reported errors and keep every feature of the sketch. \
Answer with one line starting with RATIONALE: that explains the fix, \
followed by the complete corrected sketch in a single ```cpp code block.";

/// Where repair requests go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairEndpoint {
    /// Base URL; `/chat/completions` is appended
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RepairEndpoint {
    fn default() -> Self {
        Self {
            url: std::env::var("SKETCHFORGE_REPAIR_URL")
                .unwrap_or_else(|_| "http://localhost:8080/v1".into()),
            model: std::env::var("SKETCHFORGE_REPAIR_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key: std::env::var("SKETCHFORGE_REPAIR_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            timeout_secs: 120,
        }
    }
}

impl RepairEndpoint {
    pub fn completions_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// User message for one repair
pub fn build_prompt(request: &RepairRequest) -> String {
    format!(
        "Board: {} ({})\nSketch: {}.ino (revision {}, attempt {})\n\n## Compiler errors\n\n{}\n\n## Sketch\n\n```cpp\n{}\n```",
        request.board.name,
        request.board.fqbn,
        request.sketch_name,
        request.revision,
        request.attempt,
        request.diagnostics_text(),
        request.source.trim_end()
    )
}

/// Text of the first choice
fn response_content(body: &str) -> Result<String, RepairError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| RepairError::InvalidResponse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| RepairError::InvalidResponse("no content in response".to_string()))
}

pub struct HttpRepairClient {
    endpoint: RepairEndpoint,
    client: reqwest::Client,
}

impl HttpRepairClient {
    pub fn new(endpoint: RepairEndpoint) -> Result<Self, RepairError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| RepairError::Unavailable(e.to_string()))?;
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &RepairEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl RepairCollaborator for HttpRepairClient {
    async fn propose(&self, request: &RepairRequest) -> Result<FixProposal, RepairError> {
        let body = serde_json::json!({
            "model": self.endpoint.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(request)}
            ],
            "temperature": 0.2
        });

        let mut http = self.client.post(self.endpoint.completions_url()).json(&body);
        if let Some(key) = &self.endpoint.api_key {
            http = http.bearer_auth(key);
        }
        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                RepairError::Timeout {
                    secs: self.endpoint.timeout_secs,
                }
            } else {
                RepairError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RepairError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(RepairError::Unavailable(format!("{status}: {}", text.trim())));
        }

        let content = response_content(&text)?;
        debug!(model = %self.endpoint.model, chars = content.len(), "Repair response received");
        Ok(FixProposal::from_response(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::board::BoardCatalog;
    use orchestration::diagnostics::DiagnosticParser;

    fn request() -> RepairRequest {
        RepairRequest {
            sketch_name: "blink".into(),
            source: "void loop() { digitalWrte(13, HIGH); }\n".into(),
            revision: 3,
            diagnostics: DiagnosticParser::parse(
                "/tmp/blink/blink.ino:1:15: error: 'digitalWrte' was not declared in this scope",
            ),
            board: BoardCatalog::builtin().find("Arduino Uno").cloned().unwrap(),
            attempt: 2,
        }
    }

    #[test]
    fn test_prompt_carries_diagnostics_and_source() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("Arduino Uno (arduino:avr:uno)"));
        assert!(prompt.contains("revision 3, attempt 2"));
        assert!(prompt.contains("'digitalWrte' was not declared"));
        assert!(prompt.contains("```cpp\nvoid loop()"));
    }

    #[test]
    fn test_completions_url() {
        let mut endpoint = RepairEndpoint {
            url: "http://gpu-box:8000/v1/".into(),
            model: "m".into(),
            api_key: None,
            timeout_secs: 5,
        };
        assert_eq!(endpoint.completions_url(), "http://gpu-box:8000/v1/chat/completions");
        endpoint.url = "https://api.example.com/v1/chat/completions".into();
        assert_eq!(endpoint.completions_url(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_response_to_proposal() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "RATIONALE: digitalWrte is misspelled\n```cpp\nvoid loop() { digitalWrite(13, HIGH); }\n```"
                }
            }]
        })
        .to_string();
        let proposal = FixProposal::from_response(&response_content(&body).unwrap());
        assert_eq!(proposal.rationale, "digitalWrte is misspelled");
        assert_eq!(proposal.source, "void loop() { digitalWrite(13, HIGH); }\n");
    }

    #[test]
    fn test_empty_or_malformed_response() {
        assert!(matches!(
            response_content(r#"{"choices": []}"#),
            Err(RepairError::InvalidResponse(_))
        ));
        assert!(matches!(
            response_content(r#"{"choices": [{"message": {"content": "  "}}]}"#),
            Err(RepairError::InvalidResponse(_))
        ));
        assert!(response_content("<html>").is_err());
    }
}
