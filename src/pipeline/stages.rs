//! Per-item pipeline: input resolution → match analysis → viability gate →
//! document generation. Stages only read; the dispatcher owns the write.

use std::future::Future;
use std::time::Duration;

use crate::collaborator::{Collaborator, MatchInputs};
use crate::state_machine::{FailureKind, MatchAnalysis, StageOutcome, WorkItem};
use crate::store::{StoreError, WorkStore};

/// Knobs that shape stage behaviour.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    /// Upper bound on each collaborator call.
    pub ai_timeout: Duration,
    /// Optional score floor applied on top of the collaborator's own
    /// recommendation. `None` trusts the recommendation as-is.
    pub min_match_score: Option<u8>,
    /// Reuse an analysis cached by an attempt whose generation failed.
    pub reuse_cached_analysis: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            ai_timeout: Duration::from_secs(60),
            min_match_score: None,
            reuse_cached_analysis: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Reject { reason: String },
}

/// The one decision point in the pipeline.
pub fn viability_gate(analysis: &MatchAnalysis, min_match_score: Option<u8>) -> GateDecision {
    if !analysis.should_proceed {
        return GateDecision::Reject {
            reason: analysis.reasoning.clone(),
        };
    }
    match min_match_score {
        Some(floor) if analysis.match_score < floor => GateDecision::Reject {
            reason: format!(
                "match score {} is below the minimum of {floor}",
                analysis.match_score
            ),
        },
        _ => GateDecision::Proceed,
    }
}

async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T, FailureKind>
where
    F: Future<Output = Result<T, E>>,
    E: Into<FailureKind>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(FailureKind::System(format!(
            "collaborator call timed out after {}s",
            limit.as_secs()
        ))),
    }
}

async fn resolve<S: WorkStore>(store: &S, reference: &str) -> Result<String, FailureKind> {
    store.resolve_content(reference).await.map_err(|e| match e {
        StoreError::MissingContent(_) => FailureKind::Input(e.to_string()),
        other => FailureKind::System(other.to_string()),
    })
}

pub async fn resolve_inputs<S: WorkStore>(
    store: &S,
    item: &WorkItem,
) -> Result<MatchInputs, FailureKind> {
    Ok(MatchInputs {
        subject: resolve(store, &item.subject_ref).await?,
        target: resolve(store, &item.target_ref).await?,
    })
}

async fn match_analysis<C: Collaborator>(
    collaborator: &C,
    inputs: &MatchInputs,
    item: &WorkItem,
    policy: &StagePolicy,
) -> Result<MatchAnalysis, FailureKind> {
    let cached = item.meta.cached_analysis.as_ref();
    if policy.reuse_cached_analysis {
        if let Some(analysis) = cached {
            tracing::debug!("Reusing cached match analysis");
            return Ok(analysis.clone());
        }
    }

    let analysis = bounded(policy.ai_timeout, collaborator.analyze_match(inputs)).await?;
    if let Some(previous) = cached {
        if previous.should_proceed != analysis.should_proceed {
            tracing::warn!(
                previous_should_proceed = previous.should_proceed,
                previous_score = previous.match_score,
                should_proceed = analysis.should_proceed,
                match_score = analysis.match_score,
                "Recomputed analysis disagrees with the cached one; using the new result",
            );
        }
    }
    Ok(analysis)
}

/// Run every stage for one claimed item.
pub async fn run<S: WorkStore, C: Collaborator>(
    store: &S,
    collaborator: &C,
    item: &WorkItem,
    policy: &StagePolicy,
) -> StageOutcome {
    let inputs = match resolve_inputs(store, item).await {
        Ok(inputs) => inputs,
        Err(kind) => {
            return StageOutcome::Failure {
                kind,
                analysis: None,
            };
        }
    };

    let mut analysis = match match_analysis(collaborator, &inputs, item, policy).await {
        Ok(analysis) => analysis,
        Err(kind) => {
            return StageOutcome::Failure {
                kind,
                analysis: None,
            };
        }
    };
    tracing::info!(
        match_score = analysis.match_score,
        should_proceed = analysis.should_proceed,
        "Match analysis complete",
    );

    if let GateDecision::Reject { reason } = viability_gate(&analysis, policy.min_match_score) {
        if analysis.should_proceed {
            // The score floor overrode the collaborator's recommendation.
            tracing::info!(%reason, "Score floor rejected a recommended match");
            analysis.should_proceed = false;
            analysis.reasoning = if analysis.reasoning.is_empty() {
                reason
            } else {
                format!("{} ({reason})", analysis.reasoning)
            };
        } else {
            tracing::info!(%reason, "Collaborator recommends not proceeding");
        }
        return StageOutcome::NotViable(analysis);
    }

    match bounded(
        policy.ai_timeout,
        collaborator.generate_document(&inputs, &analysis),
    )
    .await
    {
        Ok(document) => {
            tracing::info!(chars = document.text.len(), "Generated document");
            StageOutcome::MaterialsReady { analysis, document }
        }
        Err(kind) => StageOutcome::Failure {
            kind,
            analysis: Some(analysis),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(score: u8, should_proceed: bool) -> MatchAnalysis {
        MatchAnalysis {
            match_score: score,
            strengths: vec![],
            gaps: vec![],
            recommendations: vec![],
            should_proceed,
            reasoning: "collaborator says so".into(),
        }
    }

    #[test]
    fn gate_trusts_the_recommendation_without_a_floor() {
        assert_eq!(viability_gate(&analysis(5, true), None), GateDecision::Proceed);
        assert_eq!(
            viability_gate(&analysis(99, false), None),
            GateDecision::Reject {
                reason: "collaborator says so".into()
            }
        );
    }

    #[test]
    fn gate_applies_the_floor() {
        assert_eq!(viability_gate(&analysis(60, true), Some(60)), GateDecision::Proceed);
        match viability_gate(&analysis(59, true), Some(60)) {
            GateDecision::Reject { reason } => assert!(reason.contains("below the minimum of 60")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_turns_elapsed_calls_into_system_failures() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok::<_, FailureKind>(())
        };
        let err = bounded(Duration::from_secs(60), slow).await.unwrap_err();
        assert_eq!(
            err,
            FailureKind::System("collaborator call timed out after 60s".into())
        );
    }
}
