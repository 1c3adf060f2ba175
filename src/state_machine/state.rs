use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::item::{Artifacts, FailureKind, GeneratedDocument, MatchAnalysis, WorkItem};

/// Lifecycle status of a work item, as stored and as read by the dashboard.
///
/// `Processing` and `Failed` are pipeline-internal; the rest form the wire
/// enum shared with the dashboard. The pipeline drives
/// `Queued → Processing → {NotViable | MaterialsReady | Failed}`; everything
/// after `MaterialsReady` is moved by a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Queued,
    Processing,
    NotViable,
    MaterialsReady,
    Failed,
    Submitted,
    UnderReview,
    Interview,
    Rejected,
    Accepted,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 10] = [
        ApplicationStatus::Queued,
        ApplicationStatus::Processing,
        ApplicationStatus::NotViable,
        ApplicationStatus::MaterialsReady,
        ApplicationStatus::Failed,
        ApplicationStatus::Submitted,
        ApplicationStatus::UnderReview,
        ApplicationStatus::Interview,
        ApplicationStatus::Rejected,
        ApplicationStatus::Accepted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Queued => "queued",
            ApplicationStatus::Processing => "processing",
            ApplicationStatus::NotViable => "not_viable",
            ApplicationStatus::MaterialsReady => "materials_ready",
            ApplicationStatus::Failed => "failed",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::UnderReview => "under_review",
            ApplicationStatus::Interview => "interview",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Accepted => "accepted",
        }
    }

    /// Whether the pipeline is done with an item in this status.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ApplicationStatus::Queued | ApplicationStatus::Processing
        )
    }

    /// The forward-only transition graph. `Processing → Queued` is the one
    /// backward edge: a retry release or the reclaim of an abandoned claim.
    pub fn can_transition_to(&self, to: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Processing, Queued)
                | (Processing, NotViable)
                | (Processing, MaterialsReady)
                | (Processing, Failed)
                | (MaterialsReady, Submitted)
                | (Submitted, UnderReview)
                | (Submitted, Rejected)
                | (UnderReview, Interview)
                | (UnderReview, Rejected)
                | (Interview, Accepted)
                | (Interview, Rejected)
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApplicationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown application status: {0}")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
}

/// What one pass through the pipeline stages produced for an item.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The viability gate rejected the pairing.
    NotViable(MatchAnalysis),
    /// Analysis passed the gate and a document was generated.
    MaterialsReady {
        analysis: MatchAnalysis,
        document: GeneratedDocument,
    },
    /// A stage failed. `analysis` is kept when the failure came after it.
    Failure {
        kind: FailureKind,
        analysis: Option<MatchAnalysis>,
    },
}

/// Terminal result of an item as far as the pipeline is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    NotViable,
    MaterialsReady,
    Failed(FailureKind),
}

/// The result of applying a stage outcome to a claimed item.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Released back to `queued` for the next poll cycle.
    Retry { attempt: u32, reason: FailureKind },
    /// The item left dispatcher ownership.
    Complete(TerminalOutcome),
}

/// Drives a claimed `WorkItem` to its next status.
pub struct StateMachine;

impl StateMachine {
    /// Apply `outcome` to a claimed item and compute the transition.
    ///
    /// - A rejection or produced materials complete the item.
    /// - A retryable failure below `max_attempts` releases it to `queued`;
    ///   at the ceiling, or for a permanent failure, it completes as `failed`.
    ///
    /// The claim fields are cleared; callers keep the token for the
    /// compare-and-swap write.
    pub fn next(
        item: &mut WorkItem,
        outcome: StageOutcome,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let transition = match outcome {
            StageOutcome::NotViable(analysis) => {
                let reason = format!("not viable: {}", analysis.reasoning);
                item.transition_to(ApplicationStatus::NotViable, now, Some(reason.clone()))?;
                item.artifacts = Some(Artifacts::NotViable { analysis });
                item.meta.terminal_reason = Some(reason);
                item.meta.completed_at = Some(now);
                item.meta.cached_analysis = None;
                Transition::Complete(TerminalOutcome::NotViable)
            }
            StageOutcome::MaterialsReady { analysis, document } => {
                item.transition_to(ApplicationStatus::MaterialsReady, now, None)?;
                item.artifacts = Some(Artifacts::MaterialsReady { analysis, document });
                item.meta.completed_at = Some(now);
                item.meta.cached_analysis = None;
                item.meta.last_error = None;
                Transition::Complete(TerminalOutcome::MaterialsReady)
            }
            StageOutcome::Failure { kind, analysis } => {
                item.meta.last_error = Some(kind.to_string());
                if analysis.is_some() {
                    item.meta.cached_analysis = analysis;
                }
                Self::handle_failure(item, kind, max_attempts, now)?
            }
        };
        item.clear_claim();
        Ok(transition)
    }

    fn handle_failure(
        item: &mut WorkItem,
        kind: FailureKind,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let attempt = item.meta.attempt_count;
        if kind.is_retryable() && attempt < max_attempts {
            item.transition_to(
                ApplicationStatus::Queued,
                now,
                Some(format!("retry after attempt {attempt}/{max_attempts}")),
            )?;
            Ok(Transition::Retry {
                attempt,
                reason: kind,
            })
        } else {
            let reason = if kind.is_retryable() {
                format!("gave up after {attempt} attempts: {kind}")
            } else {
                kind.to_string()
            };
            item.transition_to(ApplicationStatus::Failed, now, Some(reason.clone()))?;
            item.meta.terminal_reason = Some(reason);
            item.meta.completed_at = Some(now);
            Ok(Transition::Complete(TerminalOutcome::Failed(kind)))
        }
    }

    /// Hand back a claim that was never worked on. The attempt it consumed
    /// is returned too.
    pub fn release_unstarted(
        item: &mut WorkItem,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        item.transition_to(
            ApplicationStatus::Queued,
            now,
            Some("released unstarted during shutdown".into()),
        )?;
        item.meta.attempt_count = item.meta.attempt_count.saturating_sub(1);
        item.clear_claim();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::item::DocumentKind;
    use uuid::Uuid;

    fn claimed_item() -> WorkItem {
        let mut item = WorkItem::queued("resume-1", "posting-1");
        item.claim(Uuid::new_v4(), Utc::now()).unwrap();
        item
    }

    fn analysis(should_proceed: bool) -> MatchAnalysis {
        MatchAnalysis {
            match_score: if should_proceed { 85 } else { 20 },
            strengths: vec!["Python".into(), "React".into()],
            gaps: vec!["Kubernetes".into()],
            recommendations: vec![],
            should_proceed,
            reasoning: "overlap on core stack".into(),
        }
    }

    fn document() -> GeneratedDocument {
        GeneratedDocument {
            kind: DocumentKind::CoverLetter,
            text: "Dear hiring team".into(),
            emphasized: vec!["Python".into()],
        }
    }

    #[test]
    fn status_wire_names_roundtrip() {
        for status in ApplicationStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<ApplicationStatus>().unwrap(), status);
        }
        assert!("draft".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn only_pipeline_states_are_non_terminal() {
        let open: Vec<_> = ApplicationStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        assert_eq!(
            open,
            vec![ApplicationStatus::Queued, ApplicationStatus::Processing]
        );
    }

    #[test]
    fn nothing_reverts_to_queued_except_from_processing() {
        for status in ApplicationStatus::ALL {
            let allowed = status.can_transition_to(ApplicationStatus::Queued);
            assert_eq!(allowed, status == ApplicationStatus::Processing, "{status}");
        }
    }

    #[test]
    fn human_driven_path_is_forward_only() {
        use ApplicationStatus::*;
        assert!(MaterialsReady.can_transition_to(Submitted));
        assert!(Interview.can_transition_to(Accepted));
        assert!(!Accepted.can_transition_to(Interview));
        assert!(!NotViable.can_transition_to(MaterialsReady));
        assert!(!Queued.can_transition_to(MaterialsReady));
    }

    #[test]
    fn rejection_completes_with_analysis_artifact() {
        let mut item = claimed_item();
        let t = StateMachine::next(&mut item, StageOutcome::NotViable(analysis(false)), 3, Utc::now())
            .unwrap();

        assert_eq!(t, Transition::Complete(TerminalOutcome::NotViable));
        assert_eq!(item.status, ApplicationStatus::NotViable);
        assert!(item.artifacts.as_ref().unwrap().document().is_none());
        assert!(item.meta.completed_at.is_some());
        assert!(item.meta.claim_token.is_none());
        assert!(item.meta.terminal_reason.as_ref().unwrap().contains("overlap"));
    }

    #[test]
    fn materials_complete_and_clear_cache() {
        let mut item = claimed_item();
        item.meta.cached_analysis = Some(analysis(true));
        let t = StateMachine::next(
            &mut item,
            StageOutcome::MaterialsReady {
                analysis: analysis(true),
                document: document(),
            },
            3,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(t, Transition::Complete(TerminalOutcome::MaterialsReady));
        assert_eq!(item.status, ApplicationStatus::MaterialsReady);
        assert!(item.meta.cached_analysis.is_none());
        assert_eq!(item.artifacts.unwrap().document().unwrap().text, "Dear hiring team");
    }

    #[test]
    fn retryable_failure_below_ceiling_requeues() {
        let mut item = claimed_item();
        let t = StateMachine::next(
            &mut item,
            StageOutcome::Failure {
                kind: FailureKind::System("timeout".into()),
                analysis: Some(analysis(true)),
            },
            3,
            Utc::now(),
        )
        .unwrap();

        assert!(matches!(t, Transition::Retry { attempt: 1, .. }));
        assert_eq!(item.status, ApplicationStatus::Queued);
        assert_eq!(item.meta.last_error.as_deref(), Some("System failure: timeout"));
        assert_eq!(item.meta.cached_analysis, Some(analysis(true)));
        assert!(item.meta.claimed_at.is_none());
    }

    #[test]
    fn failure_at_ceiling_is_terminal() {
        let mut item = claimed_item();
        item.meta.attempt_count = 3;
        let t = StateMachine::next(
            &mut item,
            StageOutcome::Failure {
                kind: FailureKind::Malformed("not json".into()),
                analysis: None,
            },
            3,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(
            t,
            Transition::Complete(TerminalOutcome::Failed(FailureKind::Malformed(
                "not json".into()
            )))
        );
        assert_eq!(item.status, ApplicationStatus::Failed);
        assert!(item.meta.last_error.is_some());
        assert!(item.meta.terminal_reason.as_ref().unwrap().starts_with("gave up after 3"));
    }

    #[test]
    fn permanent_failure_skips_retries() {
        let mut item = claimed_item();
        let t = StateMachine::next(
            &mut item,
            StageOutcome::Failure {
                kind: FailureKind::Input("unknown reference".into()),
                analysis: None,
            },
            3,
            Utc::now(),
        )
        .unwrap();

        assert!(matches!(t, Transition::Complete(TerminalOutcome::Failed(_))));
        assert_eq!(item.status, ApplicationStatus::Failed);
    }

    #[test]
    fn next_refuses_unclaimed_items() {
        let mut item = WorkItem::queued("a", "b");
        let err = StateMachine::next(&mut item, StageOutcome::NotViable(analysis(false)), 3, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, ApplicationStatus::Queued);
    }

    #[test]
    fn release_unstarted_returns_the_attempt() {
        let mut item = claimed_item();
        assert_eq!(item.meta.attempt_count, 1);
        StateMachine::release_unstarted(&mut item, Utc::now()).unwrap();

        assert_eq!(item.status, ApplicationStatus::Queued);
        assert_eq!(item.meta.attempt_count, 0);
        assert!(item.meta.claim_token.is_none());
    }

    #[test]
    fn history_is_recorded() {
        let mut item = claimed_item();
        StateMachine::next(
            &mut item,
            StageOutcome::Failure {
                kind: FailureKind::System("503".into()),
                analysis: None,
            },
            3,
            Utc::now(),
        )
        .unwrap();
        item.claim(Uuid::new_v4(), Utc::now()).unwrap();
        StateMachine::next(&mut item, StageOutcome::NotViable(analysis(false)), 3, Utc::now())
            .unwrap();

        let path: Vec<_> = item.meta.status_history.iter().map(|c| c.to).collect();
        assert_eq!(
            path,
            vec![
                ApplicationStatus::Processing,
                ApplicationStatus::Queued,
                ApplicationStatus::Processing,
                ApplicationStatus::NotViable,
            ]
        );
    }
}
