//! Stage sequencing as an explicit state machine, free of I/O.

use std::fmt;

use larder_shared::{LarderError, Result, Stage};

/// Where the pipeline is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running(Stage),
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(stage) => write!(f, "{stage}"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// `Fetch → Enrich → Validate → Revalidate → AssetFetch → Filter → Done`.
///
/// A transition fires only once the current stage reports that its remaining
/// set is drained: every item discovered so far is settled or has exhausted
/// its retries.
#[derive(Debug, Clone)]
pub struct StageMachine {
    state: PipelineState,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::starting_at(Stage::Fetch)
    }
}

impl StageMachine {
    pub fn starting_at(stage: Stage) -> Self {
        Self {
            state: PipelineState::Running(stage),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The stage to run next, or `None` once done.
    pub fn current(&self) -> Option<Stage> {
        match self.state {
            PipelineState::Running(stage) => Some(stage),
            PipelineState::Done => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PipelineState::Done
    }

    /// Move past the current stage. Fails if the stage has not drained.
    pub fn advance(&mut self, drained: bool) -> Result<PipelineState> {
        let PipelineState::Running(stage) = self.state else {
            return Err(LarderError::validation("pipeline already finished"));
        };
        if !drained {
            return Err(LarderError::validation(format!(
                "stage {stage} still has remaining work"
            )));
        }
        self.state = match stage.next() {
            Some(next) => PipelineState::Running(next),
            None => PipelineState::Done,
        };
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_every_stage_then_done() {
        let mut machine = StageMachine::default();
        let mut visited = Vec::new();
        while let Some(stage) = machine.current() {
            visited.push(stage);
            machine.advance(true).unwrap();
        }
        assert_eq!(visited, Stage::ALL.to_vec());
        assert!(machine.is_done());
        assert_eq!(machine.state().to_string(), "done");
    }

    #[test]
    fn undrained_stage_cannot_advance() {
        let mut machine = StageMachine::starting_at(Stage::Validate);
        assert!(machine.advance(false).is_err());
        assert_eq!(machine.current(), Some(Stage::Validate));
        assert_eq!(
            machine.advance(true).unwrap(),
            PipelineState::Running(Stage::Revalidate)
        );
    }

    #[test]
    fn done_is_terminal() {
        let mut machine = StageMachine::starting_at(Stage::Filter);
        assert_eq!(machine.advance(true).unwrap(), PipelineState::Done);
        assert!(machine.advance(true).is_err());
    }
}
