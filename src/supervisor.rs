//! Safety Supervisor (§4.13): the single process-wide RUN/HOLD state
//! machine consulted by the pre-trade gate and exposed to readiness checks.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,
    Hold,
}

#[derive(Debug, Clone)]
pub struct SafetySnapshot {
    pub mode: RunMode,
    pub safe_mode: bool,
    pub hold_active: bool,
    pub hold_reason: Option<String>,
    pub risk_throttled: bool,
    pub risk_throttle_reason: Option<String>,
}

struct State {
    mode: RunMode,
    safe_mode: bool,
    previous_safe_mode: bool,
    hold_active: bool,
    hold_reason: Option<String>,
    risk_throttled: bool,
    risk_throttle_reason: Option<String>,
}

impl State {
    fn fresh() -> Self {
        Self {
            mode: RunMode::Run,
            safe_mode: false,
            previous_safe_mode: false,
            hold_active: false,
            hold_reason: None,
            risk_throttled: false,
            risk_throttle_reason: None,
        }
    }
}

/// Process-scoped singleton. Holds an explicit `reset_for_tests` so test
/// suites can get a clean slate instead of sharing mutable global state
/// across cases, matching the pattern used by the watchdog/risk-governor
/// singletons elsewhere in this codebase.
pub struct SafetySupervisor {
    state: Mutex<State>,
}

impl Default for SafetySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetySupervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::fresh()),
        }
    }

    /// Engages HOLD. Re-engaging while already in HOLD updates the reason
    /// but does not overwrite the remembered pre-hold `safe_mode` value.
    pub fn engage_safety_hold(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.mode != RunMode::Hold {
            state.previous_safe_mode = state.safe_mode;
            state.mode = RunMode::Hold;
            state.hold_active = true;
        }
        state.hold_reason = Some(reason.into());
    }

    /// Clears HOLD and restores `safe_mode` explicitly (the caller decides
    /// the resumed value; it is not inferred from the pre-hold memo).
    pub fn autopilot_apply_resume(&self, safe_mode: bool) {
        let mut state = self.state.lock();
        state.mode = RunMode::Run;
        state.hold_active = false;
        state.hold_reason = None;
        state.safe_mode = safe_mode;
    }

    pub fn update_risk_throttle(&self, active: bool, reason: Option<String>) {
        let mut state = self.state.lock();
        state.risk_throttled = active;
        state.risk_throttle_reason = reason;
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        let state = self.state.lock();
        SafetySnapshot {
            mode: state.mode,
            safe_mode: state.safe_mode,
            hold_active: state.hold_active,
            hold_reason: state.hold_reason.clone(),
            risk_throttled: state.risk_throttled,
            risk_throttle_reason: state.risk_throttle_reason.clone(),
        }
    }

    pub fn is_holding(&self) -> bool {
        self.state.lock().mode == RunMode::Hold
    }

    pub fn previous_safe_mode(&self) -> bool {
        self.state.lock().previous_safe_mode
    }

    pub fn reset_for_tests(&self) {
        *self.state.lock() = State::fresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reengaging_hold_updates_reason_not_prehold_memo() {
        let supervisor = SafetySupervisor::new();
        supervisor.autopilot_apply_resume(true);
        supervisor.engage_safety_hold("WATCHDOG_DOWN");
        assert!(supervisor.previous_safe_mode());
        supervisor.engage_safety_hold("RECON_DIVERGENCE");
        assert_eq!(supervisor.snapshot().hold_reason.as_deref(), Some("RECON_DIVERGENCE"));
        assert!(supervisor.previous_safe_mode());
    }

    #[test]
    fn test_resume_clears_hold() {
        let supervisor = SafetySupervisor::new();
        supervisor.engage_safety_hold("X");
        assert!(supervisor.is_holding());
        supervisor.autopilot_apply_resume(false);
        assert!(!supervisor.is_holding());
        assert!(!supervisor.snapshot().safe_mode);
    }
}
