use serde::Deserialize;

use super::prompts;
use super::{Collaborator, CollaboratorError, MatchInputs};
use crate::anthropic::{Message, MessageSender, MessagesRequest};
use crate::state_machine::{DocumentKind, GeneratedDocument, MatchAnalysis};

const ANALYSIS_MAX_TOKENS: u32 = 1024;
const DOCUMENT_MAX_TOKENS: u32 = 2048;

/// Collaborator backed by a Messages API sender.
pub struct LlmCollaborator<S> {
    sender: S,
    model: String,
}

/// Analysis as the model writes it. Field names follow the prompt.
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    match_score: f64,
    #[serde(default, alias = "strengths")]
    key_strengths: Vec<String>,
    #[serde(default)]
    gaps: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(alias = "should_proceed")]
    should_apply: bool,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    document: String,
    #[serde(default)]
    emphasized: Vec<String>,
}

impl<S: MessageSender> LlmCollaborator<S> {
    pub fn new(sender: S, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
        }
    }

    async fn ask(
        &self,
        system: &str,
        prompt: String,
        max_tokens: u32,
    ) -> Result<String, CollaboratorError> {
        let req = MessagesRequest {
            model: self.model.clone(),
            max_tokens,
            system: Some(system.to_string()),
            messages: vec![Message::user(prompt)],
        };
        let response = self.sender.send_message(&req).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(CollaboratorError::Malformed("empty response".into()));
        }
        Ok(text)
    }
}

impl<S: MessageSender> Collaborator for LlmCollaborator<S> {
    async fn analyze_match(&self, inputs: &MatchInputs) -> Result<MatchAnalysis, CollaboratorError> {
        let text = self
            .ask(
                prompts::ANALYSIS_SYSTEM,
                prompts::match_analysis(&inputs.subject, &inputs.target),
                ANALYSIS_MAX_TOKENS,
            )
            .await?;
        parse_analysis(&text)
    }

    async fn generate_document(
        &self,
        inputs: &MatchInputs,
        analysis: &MatchAnalysis,
    ) -> Result<GeneratedDocument, CollaboratorError> {
        let text = self
            .ask(
                prompts::DOCUMENT_SYSTEM,
                prompts::cover_letter(&inputs.subject, &inputs.target, analysis),
                DOCUMENT_MAX_TOKENS,
            )
            .await?;
        parse_document(&text)
    }
}

/// Strips ```json ... ``` or ``` ... ``` fences around model output.
fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let inner = if let Some(stripped) = text.strip_prefix("```json") {
        stripped
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
    } else {
        return text;
    };
    inner.trim().strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_analysis(text: &str) -> Result<MatchAnalysis, CollaboratorError> {
    let raw: RawAnalysis = serde_json::from_str(strip_code_fences(text))
        .map_err(|e| CollaboratorError::Malformed(format!("analysis is not valid JSON: {e}")))?;

    if !raw.match_score.is_finite() || !(0.0..=100.0).contains(&raw.match_score) {
        return Err(CollaboratorError::Malformed(format!(
            "match_score {} out of range 0-100",
            raw.match_score
        )));
    }

    Ok(MatchAnalysis {
        match_score: raw.match_score.round() as u8,
        strengths: raw.key_strengths,
        gaps: raw.gaps,
        recommendations: raw.recommendations,
        should_proceed: raw.should_apply,
        reasoning: raw.reasoning,
    })
}

fn parse_document(text: &str) -> Result<GeneratedDocument, CollaboratorError> {
    let body = strip_code_fences(text);
    let (text, emphasized) = match serde_json::from_str::<RawDocument>(body) {
        Ok(raw) => (raw.document, raw.emphasized),
        // A plain-prose answer is still a usable letter; broken JSON is not.
        Err(_) if !body.starts_with('{') => (body.to_string(), Vec::new()),
        Err(e) => {
            return Err(CollaboratorError::Malformed(format!(
                "document is not valid JSON: {e}"
            )));
        }
    };

    if text.trim().is_empty() {
        return Err(CollaboratorError::Malformed("generated document is empty".into()));
    }

    Ok(GeneratedDocument {
        kind: DocumentKind::CoverLetter,
        text: text.trim().to_string(),
        emphasized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::AnthropicError;
    use crate::anthropic::types::{ContentBlock, MessagesResponse, Usage};
    use std::sync::Mutex;

    struct MockSender {
        response: Result<String, u16>,
        seen: Mutex<Vec<MessagesRequest>>,
    }

    impl MockSender {
        fn ok(text: &str) -> Self {
            Self {
                response: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn status(status: u16) -> Self {
            Self {
                response: Err(status),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageSender for MockSender {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> Result<MessagesResponse, AnthropicError> {
            self.seen.lock().unwrap().push(req.clone());
            match &self.response {
                Ok(text) => Ok(MessagesResponse {
                    id: "mock".into(),
                    content: vec![ContentBlock {
                        content_type: "text".into(),
                        text: text.clone(),
                    }],
                    model: "mock".into(),
                    stop_reason: Some("end_turn".into()),
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                }),
                Err(status) => Err(AnthropicError::ApiError {
                    status: *status,
                    message: "mock error".into(),
                }),
            }
        }
    }

    fn inputs() -> MatchInputs {
        MatchInputs {
            subject: "Resume: 4 years Python and React".into(),
            target: "Hiring: Python/React engineer".into(),
        }
    }

    #[test]
    fn strips_json_and_bare_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[tokio::test]
    async fn parses_fenced_analysis() {
        let sender = MockSender::ok(
            "```json\n{\"match_score\": 86.6, \"key_strengths\": [\"Python\"], \"gaps\": [], \
             \"recommendations\": [\"mention React\"], \"should_apply\": true, \"reasoning\": \"strong fit\"}\n```",
        );
        let collab = LlmCollaborator::new(sender, "claude-sonnet-4-5");
        let analysis = collab.analyze_match(&inputs()).await.unwrap();

        assert_eq!(analysis.match_score, 87);
        assert_eq!(analysis.strengths, vec!["Python".to_string()]);
        assert!(analysis.should_proceed);
        assert_eq!(analysis.reasoning, "strong fit");

        let seen = collab.sender.seen.lock().unwrap();
        assert_eq!(seen[0].model, "claude-sonnet-4-5");
        assert_eq!(seen[0].system.as_deref(), Some(prompts::ANALYSIS_SYSTEM));
        assert!(seen[0].messages[0].content.contains("Hiring: Python/React engineer"));
    }

    #[tokio::test]
    async fn out_of_range_score_is_malformed() {
        let collab = LlmCollaborator::new(
            MockSender::ok(r#"{"match_score": 140, "should_apply": true}"#),
            "m",
        );
        let err = collab.analyze_match(&inputs()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Malformed(msg) if msg.contains("140")));
    }

    #[tokio::test]
    async fn prose_analysis_never_defaults_to_viable() {
        let collab = LlmCollaborator::new(MockSender::ok("Looks like a great fit!"), "m");
        let err = collab.analyze_match(&inputs()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Malformed(_)));
    }

    #[tokio::test]
    async fn transport_errors_propagate() {
        let collab = LlmCollaborator::new(MockSender::status(503), "m");
        let err = collab.analyze_match(&inputs()).await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::Transport(AnthropicError::ApiError { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn document_from_json() {
        let collab = LlmCollaborator::new(
            MockSender::ok(r#"{"document": "Dear team,\nI build with Python.", "emphasized": ["Python"]}"#),
            "m",
        );
        let analysis = MatchAnalysis {
            match_score: 80,
            strengths: vec!["Python".into()],
            gaps: vec![],
            recommendations: vec![],
            should_proceed: true,
            reasoning: String::new(),
        };
        let doc = collab.generate_document(&inputs(), &analysis).await.unwrap();
        assert_eq!(doc.kind, DocumentKind::CoverLetter);
        assert!(doc.text.starts_with("Dear team"));
        assert_eq!(doc.emphasized, vec!["Python".to_string()]);

        let seen = collab.sender.seen.lock().unwrap();
        assert_eq!(seen[0].system.as_deref(), Some(prompts::DOCUMENT_SYSTEM));
    }

    #[test]
    fn document_accepts_plain_prose() {
        let doc = parse_document("Dear hiring manager,\nThank you.").unwrap();
        assert_eq!(doc.text, "Dear hiring manager,\nThank you.");
        assert!(doc.emphasized.is_empty());
    }

    #[test]
    fn document_rejects_broken_json_and_empty_text() {
        assert!(parse_document("{\"document\": ").is_err());
        assert!(parse_document(r#"{"document": "   "}"#).is_err());
    }
}
