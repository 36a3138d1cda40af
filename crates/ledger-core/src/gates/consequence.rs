//! Consequence preview (§4.9 / §4.7 stage 5): heuristic warnings about what
//! an event is about to do, computed before gates run so the pipeline can
//! optionally halt on a BLOCK-severity preview warning
//! (`block_on_consequence_block`).

use crate::error::Severity;
use crate::fsm;
use crate::model::{Decision, DecisionState, Event, EventType};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PreviewWarningCode {
    NotSimulated,
    IrreversibleAction,
    RiskHigh,
    MissingArtifacts,
    NoChange,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewWarning {
    pub code: PreviewWarningCode,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsequencePreview {
    pub predicted_next_state: DecisionState,
    pub delta_summary: String,
    pub warnings: Vec<PreviewWarning>,
}

impl ConsequencePreview {
    pub fn has_block(&self) -> bool {
        self.warnings.iter().any(|w| w.severity == Severity::Block)
    }
}

pub fn consequence_preview(decision: &Decision, event: &Event) -> ConsequencePreview {
    let mut warnings = Vec::new();

    let predicted = fsm::transition(
        decision.state,
        decision.pre_dispute_state_helper,
        event.event_type,
        &HashSet::new(),
    )
    .map(|t| t.state)
    .unwrap_or(decision.state);

    if event.event_type == EventType::Approve && decision.state != DecisionState::Simulated {
        warnings.push(PreviewWarning {
            code: PreviewWarningCode::NotSimulated,
            severity: Severity::Block,
            message: "approving a decision that has not been simulated".to_string(),
        });
    }

    if matches!(event.event_type, EventType::Approve | EventType::Reject | EventType::Publish) {
        warnings.push(PreviewWarning {
            code: PreviewWarningCode::IrreversibleAction,
            severity: Severity::Warn,
            message: format!("{:?} is a terminal, effectively irreversible action", event.event_type),
        });
    }

    let risk_score = event
        .payload_f64("risk_score")
        .or_else(|| decision.artifacts.get("risk")?.get("score")?.as_f64());
    if let Some(score) = risk_score {
        if score >= 0.8 {
            warnings.push(PreviewWarning {
                code: PreviewWarningCode::RiskHigh,
                severity: Severity::Warn,
                message: format!("risk_score {score} is high"),
            });
        }
    }

    if event.event_type == EventType::Approve
        && (!decision.artifacts.is_object() || decision.artifacts.as_object().unwrap().is_empty())
    {
        warnings.push(PreviewWarning {
            code: PreviewWarningCode::MissingArtifacts,
            severity: Severity::Info,
            message: "no artifacts attached before approval".to_string(),
        });
    }

    if predicted == decision.state && event.event_type.is_state_mutating() {
        warnings.push(PreviewWarning {
            code: PreviewWarningCode::NoChange,
            severity: Severity::Info,
            message: "this event does not change the decision's state".to_string(),
        });
    }

    ConsequencePreview {
        predicted_next_state: predicted,
        delta_summary: format!("{:?} -> {:?} via {:?}", decision.state, predicted, event.event_type),
        warnings,
    }
}
