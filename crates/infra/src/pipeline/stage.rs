//! Per-message processing stages.
//!
//! ```text
//! Received -> Validating -> Validated -> Publishing -> Delivered
//!                      \-> Invalid -> DeadLettered
//! Publishing -> PublishFailed -> Retrying -> Publishing
//!                            \-> DeadLettered   (fatal error)
//!                                Retrying -> DeadLettered   (attempts exhausted)
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Validating,
    Validated,
    Invalid,
    Publishing,
    PublishFailed,
    Retrying,
    Delivered,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal stage transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub to: Stage,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLettered)
    }

    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Validated)
                | (Validating, Invalid)
                | (Validated, Publishing)
                | (Invalid, DeadLettered)
                | (Publishing, Delivered)
                | (Publishing, PublishFailed)
                | (PublishFailed, Retrying)
                | (PublishFailed, DeadLettered)
                | (Retrying, Publishing)
                | (Retrying, DeadLettered)
        )
    }

    pub fn advance(self, next: Stage) -> Result<Stage, InvalidTransition> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }
}

/// Stage of the message a worker is currently handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFlow {
    stage: Stage,
}

impl MessageFlow {
    pub fn received() -> Self {
        Self { stage: Stage::Received }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn to(&mut self, next: Stage) -> Result<(), InvalidTransition> {
        self.stage = self.stage.advance(next)?;
        Ok(())
    }
}
