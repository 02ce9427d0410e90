//! Scan session state machine.

use std::fmt;

use crate::error::DriverError;

/// Lifecycle state of one scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session on the device.
    #[default]
    Idle,
    /// Session requested; calibration and parameter upload.
    Warmup,
    /// Parameters accepted, waiting for image data.
    Scanning,
    /// Image blocks are flowing.
    Transferring,
    /// End of image, error or cancellation; teardown pending.
    Finished,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Warmup => write!(f, "WARMUP"),
            SessionState::Scanning => write!(f, "SCANNING"),
            SessionState::Transferring => write!(f, "TRANSFERRING"),
            SessionState::Finished => write!(f, "FINISHED"),
        }
    }
}

impl SessionState {
    /// A session is open on the device.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Warmup | SessionState::Scanning | SessionState::Transferring
        )
    }

    /// Image blocks may be requested in this state.
    pub fn can_read(&self) -> bool {
        matches!(self, SessionState::Scanning | SessionState::Transferring)
    }

    fn may_advance_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Warmup)
                | (Warmup, Scanning)
                | (Scanning, Transferring)
                | (Warmup | Scanning | Transferring, Finished)
                | (Finished, Idle)
        )
    }
}

#[derive(Debug, Default)]
pub struct SessionMachine {
    state: SessionState,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition to a new state. Returns the state left.
    pub fn goto_state(&mut self, new_state: SessionState) -> Result<SessionState, DriverError> {
        if !self.state.may_advance_to(new_state) {
            return Err(DriverError::InvalidState(format!(
                "{} -> {}",
                self.state, new_state
            )));
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        let from = self.state;
        self.state = new_state;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let mut m = SessionMachine::new();
        for to in [
            SessionState::Warmup,
            SessionState::Scanning,
            SessionState::Transferring,
            SessionState::Finished,
            SessionState::Idle,
        ] {
            m.goto_state(to).unwrap();
        }
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn test_rejects_skips_and_reversal() {
        let mut m = SessionMachine::new();
        assert!(m.goto_state(SessionState::Scanning).is_err());
        assert!(m.goto_state(SessionState::Finished).is_err());
        m.goto_state(SessionState::Warmup).unwrap();
        assert!(m.goto_state(SessionState::Idle).is_err());
        assert_eq!(m.goto_state(SessionState::Finished).unwrap(), SessionState::Warmup);
        assert!(!m.state().is_active());
    }
}
