/// Which completion signal a barrier update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    Analysis,
    Battle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// The other signal has not arrived yet.
    Waiting,
    /// Both signals are in; the caller must display results now.
    Fire,
    /// Results were already displayed for this run.
    AlreadyFired,
}

/// Unordered two-source completion barrier. Fires once per run when both
/// `analysis_complete` and `battle_results` have been seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionBarrier {
    analysis_completed: bool,
    battle_completed: bool,
    fired: bool,
}

impl CompletionBarrier {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn mark(&mut self, signal: CompletionSignal) -> BarrierOutcome {
        match signal {
            CompletionSignal::Analysis => self.analysis_completed = true,
            CompletionSignal::Battle => self.battle_completed = true,
        }

        if self.fired {
            return BarrierOutcome::AlreadyFired;
        }
        if self.analysis_completed && self.battle_completed {
            self.fired = true;
            return BarrierOutcome::Fire;
        }
        BarrierOutcome::Waiting
    }

    pub fn analysis_completed(&self) -> bool {
        self.analysis_completed
    }

    pub fn battle_completed(&self) -> bool {
        self.battle_completed
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
