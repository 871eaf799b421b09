use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::EngineError;

lazy_static! {
    static ref PERCENT_PATTERN: Regex =
        Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*%").unwrap();
}

/// Events pushed up from the engine's background thread. Delivery order
/// matches emission order; the session latches faults and folds
/// progress into its own state.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Simulation progress in percent, 0 to 100.
    Progress(f64),
    /// A line of engine console output.
    Message(String),
    /// The engine reported an internal fault. The run is over; no
    /// further events follow except the exit notice.
    Fault(String),
    /// Background thread liveness, reported as it flips.
    Thread { running: bool },
    /// The background thread finished, cleanly or not.
    Exited { ok: bool },
}

/// Callbacks an engine invokes from its background thread. Handlers
/// must not call back into the engine and must not block; in particular
/// `boundary_value` is answered during a paused run, so it must never
/// wait on session state.
pub trait EngineHooks: Send + Sync {
    fn status(&self, event: StatusEvent);

    /// Answer a data request for the element named `name` at simulated
    /// time `t`. `None` means the name is unknown to the session.
    fn boundary_value(&self, name: &str, t: f64) -> Option<f64>;
}

/// A backgrounded simulation engine.
///
/// The contract mirrors a batch solver driven over a command pipe:
/// `init` wires up the callbacks once, `load` hands over circuit lines,
/// `run`/`halt`/`resume` steer the background thread, and `command`
/// passes a raw control line through. All methods are synchronous
/// requests; completion is reported through the hooks.
pub trait Engine: Send {
    fn init(&mut self, hooks: Arc<dyn EngineHooks>) -> Result<(), EngineError>;

    fn load(&mut self, lines: &[String]) -> Result<(), EngineError>;

    fn run(&mut self) -> Result<(), EngineError>;

    fn halt(&mut self) -> Result<(), EngineError>;

    fn resume(&mut self) -> Result<(), EngineError>;

    fn command(&mut self, cmd: &str) -> Result<(), EngineError>;

    fn is_running(&self) -> bool;
}

/// Extract a progress percentage from an engine status line such as
/// `tran: 34.5%`. The ready marker emitted after the final step counts
/// as 100.
pub fn parse_progress(status: &str) -> Option<f64> {
    if status.contains("--ready--") {
        return Some(100.0);
    }
    PERCENT_PATTERN
        .captures(status)
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
        .map(|p: f64| p.clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("tran: 34.5%"), Some(34.5));
        assert_eq!(parse_progress("tran: 7%"), Some(7.0));
        assert_eq!(parse_progress("--ready--"), Some(100.0));
        assert_eq!(parse_progress("loading circuit"), None);
    }

    #[test]
    fn test_parse_progress_clamps() {
        assert_eq!(parse_progress("tran: 120%"), Some(100.0));
    }
}
