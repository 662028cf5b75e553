//! Profile replay: the scheduled basal runs unchanged.

use super::{DosingStrategy, NoChangeReason, Proposal, StrategyInput};
use crate::error::StrategyError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileReplay;

impl DosingStrategy for ProfileReplay {
    fn name(&self) -> &'static str {
        "profile-replay"
    }

    fn propose(&self, _input: &StrategyInput<'_>) -> Result<Proposal, StrategyError> {
        Ok(Proposal::NoChange(NoChangeReason::ProfileReplay))
    }
}
