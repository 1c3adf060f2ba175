//! The AI collaborator: the black-box capability the pipeline delegates
//! match analysis and document generation to.
//!
//! [`Collaborator`] is the seam the dispatcher is generic over.
//! [`LlmCollaborator`] implements it on top of any
//! [`MessageSender`](crate::anthropic::MessageSender).

mod llm;
pub mod prompts;

pub use llm::LlmCollaborator;

use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::state_machine::{FailureKind, GeneratedDocument, MatchAnalysis};

/// Resolved text for both sides of a pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchInputs {
    /// The candidate's source material (resume/profile text).
    pub subject: String,
    /// The posting being matched against.
    pub target: String,
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error(transparent)]
    Transport(#[from] AnthropicError),

    #[error("collaborator returned an unusable response: {0}")]
    Malformed(String),
}

impl CollaboratorError {
    /// Map onto the retry taxonomy. Transient transport failures and
    /// unusable answers are retried until the attempt ceiling; a request
    /// the API rejected outright fails the item at once.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CollaboratorError::Transport(AnthropicError::InvalidResponse(msg)) => {
                FailureKind::Malformed(msg.clone())
            }
            CollaboratorError::Transport(e) if e.is_transient() => {
                FailureKind::System(e.to_string())
            }
            CollaboratorError::Transport(e) => FailureKind::Input(e.to_string()),
            CollaboratorError::Malformed(msg) => FailureKind::Malformed(msg.clone()),
        }
    }
}

impl From<CollaboratorError> for FailureKind {
    fn from(err: CollaboratorError) -> Self {
        err.failure_kind()
    }
}

pub trait Collaborator {
    /// Assess how well the subject fits the target.
    async fn analyze_match(&self, inputs: &MatchInputs) -> Result<MatchAnalysis, CollaboratorError>;

    /// Produce a tailored document, leaning on the analysis' strengths and
    /// addressing its gaps without adding claims absent from the subject.
    async fn generate_document(
        &self,
        inputs: &MatchInputs,
        analysis: &MatchAnalysis,
    ) -> Result<GeneratedDocument, CollaboratorError>;
}
