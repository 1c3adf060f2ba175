use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{ApplicationStatus, TransitionError};

/// Distinguishes the ways a pipeline stage can fail.
///
/// `System` and `Malformed` are retried until the attempt ceiling; `Input`
/// is permanent because no later attempt can change the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure failed (collaborator timeout, 5xx, rate limit, store read).
    System(String),
    /// The collaborator answered but the answer could not be used.
    Malformed(String),
    /// The work item's inputs could not be resolved, or the request built
    /// from them was rejected.
    Input(String),
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Input(_))
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::System(msg) => write!(f, "System failure: {msg}"),
            FailureKind::Malformed(msg) => write!(f, "Malformed response: {msg}"),
            FailureKind::Input(msg) => write!(f, "Input failure: {msg}"),
        }
    }
}

/// Structured compatibility assessment produced by the match-analysis stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAnalysis {
    pub match_score: u8,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub should_proceed: bool,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    CoverLetter,
}

/// A tailored document produced by the generation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub kind: DocumentKind,
    pub text: String,
    /// What the document leaned on from the subject's material.
    #[serde(default)]
    pub emphasized: Vec<String>,
}

/// Output attached to a work item, one variant per terminal status that
/// carries artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifacts {
    NotViable {
        analysis: MatchAnalysis,
    },
    MaterialsReady {
        analysis: MatchAnalysis,
        document: GeneratedDocument,
    },
}

impl Artifacts {
    pub fn analysis(&self) -> &MatchAnalysis {
        match self {
            Artifacts::NotViable { analysis } | Artifacts::MaterialsReady { analysis, .. } => {
                analysis
            }
        }
    }

    pub fn document(&self) -> Option<&GeneratedDocument> {
        match self {
            Artifacts::NotViable { .. } => None,
            Artifacts::MaterialsReady { document, .. } => Some(document),
        }
    }
}

/// One entry in a work item's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Dispatcher bookkeeping stored next to the item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingMeta {
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub claim_token: Option<Uuid>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub terminal_reason: Option<String>,
    /// Analysis kept from an attempt whose generation stage failed.
    #[serde(default)]
    pub cached_analysis: Option<MatchAnalysis>,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
}

/// A queued unit of pipeline work: one subject/target pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub status: ApplicationStatus,
    pub subject_ref: String,
    pub target_ref: String,
    pub artifacts: Option<Artifacts>,
    pub meta: ProcessingMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A fresh item in `queued`, as the enqueue interface creates it.
    pub fn queued(subject_ref: impl Into<String>, target_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: ApplicationStatus::Queued,
            subject_ref: subject_ref.into(),
            target_ref: target_ref.into(),
            artifacts: None,
            meta: ProcessingMeta::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, appending the change to the audit trail.
    pub fn transition_to(
        &mut self,
        to: ApplicationStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.meta.status_history.push(StatusChange {
            from: self.status,
            to,
            at,
            reason,
        });
        self.status = to;
        self.updated_at = at;
        Ok(())
    }

    /// Stamp a new claim. Used by stores that claim in application code.
    pub fn claim(&mut self, token: Uuid, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status == ApplicationStatus::Processing {
            // Reclaim: the abandoned claim goes back through queued so the
            // trail shows both hops.
            self.transition_to(
                ApplicationStatus::Queued,
                at,
                Some("stale claim reclaimed".into()),
            )?;
        }
        self.transition_to(ApplicationStatus::Processing, at, None)?;
        self.meta.claimed_at = Some(at);
        self.meta.claim_token = Some(token);
        self.meta.attempt_count += 1;
        Ok(())
    }

    pub fn clear_claim(&mut self) {
        self.meta.claimed_at = None;
        self.meta.claim_token = None;
    }
}
