//! Cooperative light (aim) loop: continuously re-executes a caller-supplied
//! "aim" pattern while the engine is otherwise idle, yielding promptly when
//! real marking work needs the session.
//!
//! Restructured from `balor.sender.Sender`'s dedicated light-loop thread
//! into a loop driven by the caller's own task, since [`Session`] already
//! serializes device access through its internal lock — a second OS thread
//! would only contend on that lock, not add concurrency.

use std::sync::{Arc, Mutex};

use crate::commandlist::CommandList;
use crate::engine::Session;
use crate::error::{ExecResult, Result};
use crate::transport::Transport;

/// Holds the current aim pattern and drives it through a [`Session`] one
/// iteration at a time.
pub struct LightLoop<T: Transport> {
    session: Arc<Session<T>>,
    pattern: Mutex<Option<CommandList>>,
}

impl<T: Transport> LightLoop<T> {
    /// Build a light loop bound to `session`. Starts with no pattern set
    /// (idle).
    pub fn new(session: Arc<Session<T>>) -> Self {
        LightLoop { session, pattern: Mutex::new(None) }
    }

    /// Set (or clear, with `None`) the aim pattern. Takes effect at the
    /// start of the next iteration.
    pub fn set_pattern(&self, pattern: Option<CommandList>) {
        *self.pattern.lock().unwrap() = pattern;
    }

    /// Run one iteration: if a pattern is set, upload and execute it once.
    /// Returns `Ok(None)` if there was no pattern to run.
    pub fn step(&self) -> Result<Option<ExecResult>> {
        let pattern = self.pattern.lock().unwrap();
        match pattern.as_ref() {
            Some(cmd) => Ok(Some(self.session.run_once(cmd)?)),
            None => Ok(None),
        }
    }

    /// Run iterations until [`LightLoop::set_pattern`] is called with
    /// `None`, or a real job aborts the session.
    pub fn run_until_cleared(&self) -> Result<()> {
        loop {
            match self.step()? {
                None => return Ok(()),
                Some(ExecResult::Aborted) => return Ok(()),
                Some(ExecResult::Completed) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CorrectionTable;
    use crate::config::InitConfig;
    use crate::protocol::status_bit;
    use crate::transport::MockTransport;

    fn idle_session() -> Arc<Session<MockTransport>> {
        let transport = MockTransport::new(status_bit::READY);
        Arc::new(Session::open_mock(transport, &InitConfig::default(), &CorrectionTable::identity()).unwrap())
    }

    #[test]
    fn step_is_noop_with_no_pattern() {
        let loop_ = LightLoop::new(idle_session());
        assert_eq!(loop_.step().unwrap(), None);
    }

    #[test]
    fn clearing_pattern_stops_run_until_cleared() {
        let loop_ = LightLoop::new(idle_session());
        let mut cmd = CommandList::new();
        cmd.ready();
        loop_.set_pattern(Some(cmd));
        // run_until_cleared loops while a pattern is set and Completed is
        // returned; clear it up front so the call returns promptly.
        loop_.set_pattern(None);
        loop_.run_until_cleared().unwrap();
    }
}
