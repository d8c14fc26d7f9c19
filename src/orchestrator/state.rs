use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// States of the per-request verification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Routing,
    Tier1A,
    Tier1B,
    Tier2,
    Fallback,
    Done,
}

impl PipelineState {
    pub fn allowed_transitions(&self) -> &'static [PipelineState] {
        use PipelineState::*;
        match self {
            Routing => &[Tier1A, Tier2],
            Tier1A => &[Done, Tier1B],
            // Cancellation mid-tier jumps straight to Fallback.
            Tier1B => &[Done, Tier2, Fallback],
            Tier2 => &[Done, Fallback],
            Fallback => &[Done],
            Done => &[],
        }
    }

    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Routing => "Routing",
            Self::Tier1A => "Tier1A",
            Self::Tier1B => "Tier1B",
            Self::Tier2 => "Tier2",
            Self::Fallback => "Fallback",
            Self::Done => "Done",
        };
        write!(f, "{}", s)
    }
}

/// One recorded pipeline transition, kept for the request's trace log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl PipelineTransition {
    pub fn new(from: PipelineState, to: PipelineState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}
