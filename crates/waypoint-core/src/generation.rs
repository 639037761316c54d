use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a story-generation job, embedded on the owning task row.
///
/// Exactly one generation may be in flight per task; a second request while
/// `Generating` is rejected. Workers mark `Done` on both success and failure
/// paths; callers detect failure by the absence of generated stories, not by
/// a distinct status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    NotStarted,
    Generating,
    Done,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// The full transition table. `Done -> NotStarted` re-arms a task for
    /// another generation pass.
    pub fn can_transition(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Generating)
                | (Self::Generating, Self::Done)
                | (Self::Done, Self::NotStarted)
        )
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not_started",
            Self::Generating => "generating",
            Self::Done => "done",
        })
    }
}

impl FromStr for GenerationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "generating" => Ok(Self::Generating),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown generation status: {other}")),
        }
    }
}
