use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::engine::{parse_progress, Engine, EngineHooks, StatusEvent};
use crate::error::{EngineError, SessionError};
use crate::netlist::Netlist;
use crate::waveform::WaveformTable;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Complete,
    Faulted,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Complete => "complete",
            SessionState::Faulted => "faulted",
        }
    }
}

/// Where boundary-value callbacks are answered from. Both variants are
/// immutable once the session is built, so the callback thread reads
/// them without any lock.
pub enum BoundarySource {
    /// Tables registered on a compiled or loaded netlist.
    Bindings(Arc<Netlist>),
    /// Bare tables keyed by lower-cased element name.
    Tables(Arc<HashMap<String, WaveformTable>>),
}

impl BoundarySource {
    fn lookup(&self, name: &str, t: f64) -> Option<f64> {
        match self {
            BoundarySource::Bindings(netlist) => netlist.boundary_value(name, t),
            BoundarySource::Tables(tables) => {
                tables.get(&name.to_lowercase()).map(|table| table.lookup(t))
            }
        }
    }
}

/// Optional sink for engine chatter, called from the engine's
/// background thread.
pub trait SessionObserver: Send + Sync {
    fn progress(&self, _percent: f64) {}
    fn message(&self, _line: &str) {}
}

/// State shared with the callback handlers. `fault` is latched: once
/// set it stays for the life of the session, and every command reports
/// it before doing anything else.
#[derive(Debug, Default)]
struct Cell {
    thread_running: bool,
    progress: f64,
    fault: Option<String>,
    exited: bool,
}

#[derive(Default)]
struct Shared {
    cell: Mutex<Cell>,
    cond: Condvar,
}

struct SessionHooks {
    shared: Arc<Shared>,
    source: BoundarySource,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl EngineHooks for SessionHooks {
    fn status(&self, event: StatusEvent) {
        let mut cell = self.shared.cell.lock().unwrap();
        match event {
            StatusEvent::Progress(p) => {
                cell.progress = p;
                if let Some(obs) = &self.observer {
                    obs.progress(p);
                }
            }
            StatusEvent::Message(line) => {
                if let Some(p) = parse_progress(&line) {
                    cell.progress = p;
                    if let Some(obs) = &self.observer {
                        obs.progress(p);
                    }
                }
                if let Some(obs) = &self.observer {
                    obs.message(&line);
                }
            }
            StatusEvent::Fault(msg) => {
                warn!("engine fault: {}", msg);
                cell.fault = Some(msg);
            }
            StatusEvent::Thread { running } => {
                cell.thread_running = running;
            }
            StatusEvent::Exited { ok } => {
                cell.thread_running = false;
                cell.exited = true;
                if !ok && cell.fault.is_none() {
                    cell.fault = Some("engine exited abnormally".to_string());
                }
            }
        }
        self.shared.cond.notify_all();
    }

    fn boundary_value(&self, name: &str, t: f64) -> Option<f64> {
        match self.source.lookup(name, t) {
            Some(v) => Some(v),
            None => {
                // An unknown name is the engine's bug, not ours; keep
                // the run alive with a neutral value.
                warn!("no boundary condition registered for '{}', answering 0", name);
                Some(0.0)
            }
        }
    }
}

/// Drives one engine through the run lifecycle.
///
/// Commands are synchronous: `start`, `pause` and `resume` dispatch to
/// the engine and then block until the background thread acknowledges
/// the liveness flip, bounded by the ack timeout. Engine faults raised
/// on the callback thread are latched and returned from the next
/// command rather than thrown across the callback boundary.
pub struct SimulationSession<E: Engine> {
    engine: E,
    shared: Arc<Shared>,
    lines: Vec<String>,
    state: SessionState,
    ack_timeout: Duration,
}

impl<E: Engine> SimulationSession<E> {
    /// Build a session over a compiled or loaded netlist. The netlist's
    /// boundary tables answer the engine's data requests.
    pub fn new(engine: E, netlist: Arc<Netlist>) -> Result<Self, SessionError> {
        let lines = netlist.to_lines();
        Self::with_parts(engine, lines, BoundarySource::Bindings(netlist), None)
    }

    /// Like [`SimulationSession::new`], with an observer for engine
    /// chatter.
    pub fn with_observer(
        engine: E,
        netlist: Arc<Netlist>,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, SessionError> {
        let lines = netlist.to_lines();
        Self::with_parts(engine, lines, BoundarySource::Bindings(netlist), Some(observer))
    }

    /// Build a session over raw circuit lines and standalone boundary
    /// tables, for circuits that never went through the compiler.
    pub fn from_tables(
        engine: E,
        lines: Vec<String>,
        tables: Arc<HashMap<String, WaveformTable>>,
    ) -> Result<Self, SessionError> {
        Self::with_parts(engine, lines, BoundarySource::Tables(tables), None)
    }

    fn with_parts(
        mut engine: E,
        lines: Vec<String>,
        source: BoundarySource,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Result<Self, SessionError> {
        let shared = Arc::new(Shared::default());
        let hooks = Arc::new(SessionHooks {
            shared: Arc::clone(&shared),
            source,
            observer,
        });
        engine.init(hooks)?;
        Ok(SimulationSession {
            engine,
            shared,
            lines,
            state: SessionState::Idle,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        })
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Current lifecycle state, folding in anything the callback thread
    /// reported since the last look.
    pub fn state(&mut self) -> SessionState {
        self.refresh();
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.shared.cell.lock().unwrap().progress
    }

    /// Load the circuit and kick off the run in the engine's
    /// background thread.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.take_fault()?;
        if self.state() != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state.name()));
        }
        let load = self.engine.load(&self.lines);
        self.dispatch(load)?;
        let run = self.engine.run();
        self.dispatch(run)?;
        self.wait_for("start", |c| c.thread_running)?;
        self.state = SessionState::Running;
        info!("simulation started");
        Ok(())
    }

    /// Halt the background thread, keeping all progress.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        self.take_fault()?;
        if self.state() != SessionState::Running {
            return Err(SessionError::InvalidState(self.state.name()));
        }
        let halt = self.engine.halt();
        self.dispatch(halt)?;
        self.wait_for("pause", |c| !c.thread_running)?;
        self.state = SessionState::Paused;
        debug!("paused at {:.1}%", self.progress());
        Ok(())
    }

    /// Continue a paused run from where it halted.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        self.take_fault()?;
        if self.state() != SessionState::Paused {
            return Err(SessionError::InvalidState(self.state.name()));
        }
        let resume = self.engine.resume();
        self.dispatch(resume)?;
        self.wait_for("resume", |c| c.thread_running)?;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Throw away a paused run and start over from time zero: progress
    /// resets, the circuit is reloaded, and the run begins again.
    pub fn restart(&mut self) -> Result<(), SessionError> {
        self.take_fault()?;
        if self.state() != SessionState::Paused {
            return Err(SessionError::InvalidState(self.state.name()));
        }
        {
            let mut cell = self.shared.cell.lock().unwrap();
            *cell = Cell::default();
        }
        self.state = SessionState::Idle;
        info!("session reset, starting over");
        self.start()
    }

    /// Write the named result vectors to `path`. The engine's output
    /// format is switched for the write and restored afterwards.
    pub fn save_results<P: AsRef<Path>>(
        &mut self,
        vectors: &[String],
        ascii: bool,
        path: P,
    ) -> Result<(), SessionError> {
        self.take_fault()?;
        self.require_results()?;
        let format = if ascii { "ascii" } else { "binary" };
        self.engine.command(&format!("set filetype={}", format))?;
        self.engine.command(&format!(
            "write {} {}",
            path.as_ref().display(),
            vectors.join(" ")
        ))?;
        self.engine.command("set filetype=binary")?;
        info!("results written to {}", path.as_ref().display());
        Ok(())
    }

    /// Plot the named result vectors to `path`, as PNG or PostScript.
    /// The engine's plot terminal is switched for the write and
    /// restored afterwards.
    pub fn plot_results<P: AsRef<Path>>(
        &mut self,
        vectors: &[String],
        png: bool,
        path: P,
    ) -> Result<(), SessionError> {
        self.take_fault()?;
        self.require_results()?;
        let terminal = if png { "png" } else { "postscript" };
        self.engine
            .command(&format!("set gnuplot_terminal={}", terminal))?;
        self.engine.command(&format!(
            "gnuplot {} {}",
            path.as_ref().display(),
            vectors.join(" ")
        ))?;
        self.engine.command("unset gnuplot_terminal")?;
        Ok(())
    }

    /// Results exist once the run has been at least partly executed.
    fn require_results(&mut self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Paused | SessionState::Complete => Ok(()),
            other => Err(SessionError::InvalidState(other.name())),
        }
    }

    fn refresh(&mut self) {
        let cell = self.shared.cell.lock().unwrap();
        if cell.fault.is_some() {
            self.state = SessionState::Faulted;
        } else if self.state == SessionState::Running
            && (cell.exited || cell.progress >= 100.0)
        {
            // full progress alone ends the run; the thread-liveness
            // flag may lag behind the final progress report
            self.state = SessionState::Complete;
        }
    }

    /// A rejected engine command is a fault: latch it so every later
    /// command reports the same terminal condition.
    fn dispatch(&mut self, result: Result<(), EngineError>) -> Result<(), SessionError> {
        if let Err(e) = result {
            self.shared.cell.lock().unwrap().fault = Some(e.to_string());
            self.state = SessionState::Faulted;
            return Err(SessionError::Engine(e));
        }
        Ok(())
    }

    /// Surface a fault latched by the callback handlers.
    fn take_fault(&mut self) -> Result<(), SessionError> {
        let fault = self.shared.cell.lock().unwrap().fault.clone();
        match fault {
            Some(msg) => {
                self.state = SessionState::Faulted;
                Err(SessionError::EngineFault(msg))
            }
            None => Ok(()),
        }
    }

    /// Block until the callback thread confirms `pred`, a latched fault
    /// appears, or the ack timeout runs out.
    fn wait_for(
        &mut self,
        verb: &'static str,
        pred: impl Fn(&Cell) -> bool,
    ) -> Result<(), SessionError> {
        let guard = self.shared.cell.lock().unwrap();
        let (guard, timeout) = self
            .shared
            .cond
            .wait_timeout_while(guard, self.ack_timeout, |c| {
                !pred(c) && c.fault.is_none()
            })
            .unwrap();
        if let Some(msg) = guard.fault.clone() {
            drop(guard);
            self.state = SessionState::Faulted;
            return Err(SessionError::EngineFault(msg));
        }
        if timeout.timed_out() {
            return Err(SessionError::EngineUnresponsive(verb));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    #[derive(Default)]
    struct FakeState {
        hooks: Option<Arc<dyn EngineHooks>>,
        loads: usize,
        commands: Vec<String>,
        mute: bool,
        running: bool,
    }

    /// Engine double that acknowledges liveness flips synchronously
    /// from inside run/halt/resume, the way a callback-driven engine
    /// does from its worker thread.
    #[derive(Clone, Default)]
    struct FakeEngine(Arc<StdMutex<FakeState>>);

    impl FakeEngine {
        fn hooks(&self) -> Arc<dyn EngineHooks> {
            self.0.lock().unwrap().hooks.clone().unwrap()
        }

        fn emit(&self, event: StatusEvent) {
            self.hooks().status(event);
        }

        fn flip(&self, running: bool) {
            let mute = {
                let mut state = self.0.lock().unwrap();
                state.running = running;
                state.mute
            };
            if !mute {
                self.emit(StatusEvent::Thread { running });
            }
        }
    }

    impl Engine for FakeEngine {
        fn init(&mut self, hooks: Arc<dyn EngineHooks>) -> Result<(), EngineError> {
            self.0.lock().unwrap().hooks = Some(hooks);
            Ok(())
        }

        fn load(&mut self, _lines: &[String]) -> Result<(), EngineError> {
            self.0.lock().unwrap().loads += 1;
            Ok(())
        }

        fn run(&mut self) -> Result<(), EngineError> {
            self.flip(true);
            Ok(())
        }

        fn halt(&mut self) -> Result<(), EngineError> {
            self.flip(false);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), EngineError> {
            self.flip(true);
            Ok(())
        }

        fn command(&mut self, cmd: &str) -> Result<(), EngineError> {
            self.0.lock().unwrap().commands.push(cmd.to_string());
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.0.lock().unwrap().running
        }
    }

    fn netlist_with_bc() -> Arc<Netlist> {
        let mut netlist = Netlist::new("test");
        let table =
            WaveformTable::from_samples(vec![(0.0, 0.0), (0.5, 1.0), (1.0, 0.0)], 1.0).unwrap();
        netlist.add_external_element("Vin", 1, 0, table);
        netlist.add_element("R1", 1, 0, "100");
        Arc::new(netlist)
    }

    fn session(engine: FakeEngine) -> SimulationSession<FakeEngine> {
        SimulationSession::new(engine, netlist_with_bc()).unwrap()
    }

    #[test]
    fn test_lifecycle_to_complete() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        assert_eq!(s.state(), SessionState::Idle);

        s.start().unwrap();
        assert_eq!(s.state(), SessionState::Running);

        engine.emit(StatusEvent::Progress(42.0));
        assert_eq!(s.progress(), 42.0);

        engine.emit(StatusEvent::Progress(100.0));
        engine.emit(StatusEvent::Thread { running: false });
        engine.emit(StatusEvent::Exited { ok: true });
        assert_eq!(s.state(), SessionState::Complete);
    }

    #[test]
    fn test_full_progress_alone_completes() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();

        // no liveness flip, no exit notice: 100% by itself ends the run
        engine.emit(StatusEvent::Progress(100.0));
        assert_eq!(s.state(), SessionState::Complete);
    }

    #[test]
    fn test_progress_from_status_message() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();
        engine.emit(StatusEvent::Message("tran: 34.5%".to_string()));
        assert_eq!(s.progress(), 34.5);
    }

    #[test]
    fn test_pause_and_resume_keep_progress() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();
        engine.emit(StatusEvent::Progress(60.0));

        s.pause().unwrap();
        assert_eq!(s.state(), SessionState::Paused);
        assert_eq!(s.progress(), 60.0);

        s.resume().unwrap();
        assert_eq!(s.state(), SessionState::Running);
        assert_eq!(s.progress(), 60.0);
    }

    #[test]
    fn test_invalid_transitions() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        assert!(matches!(
            s.pause().unwrap_err(),
            SessionError::InvalidState("idle")
        ));
        s.start().unwrap();
        assert!(matches!(
            s.start().unwrap_err(),
            SessionError::InvalidState("running")
        ));
        assert!(matches!(
            s.restart().unwrap_err(),
            SessionError::InvalidState("running")
        ));
    }

    #[test]
    fn test_fault_is_latched_and_reported_on_next_command() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();

        engine.emit(StatusEvent::Fault("singular matrix".to_string()));
        assert_eq!(s.state(), SessionState::Faulted);
        let err = s.pause().unwrap_err();
        assert!(matches!(err, SessionError::EngineFault(msg) if msg.contains("singular")));
        // still latched, a faulted session stays dead
        assert!(s.resume().is_err());
        assert!(s.restart().is_err());
    }

    #[test]
    fn test_rejected_command_faults_the_session() {
        struct RejectingEngine;
        impl Engine for RejectingEngine {
            fn init(&mut self, _hooks: Arc<dyn EngineHooks>) -> Result<(), EngineError> {
                Ok(())
            }
            fn load(&mut self, _lines: &[String]) -> Result<(), EngineError> {
                Ok(())
            }
            fn run(&mut self) -> Result<(), EngineError> {
                Err(EngineError::Rejected("bg_run".to_string()))
            }
            fn halt(&mut self) -> Result<(), EngineError> {
                Ok(())
            }
            fn resume(&mut self) -> Result<(), EngineError> {
                Ok(())
            }
            fn command(&mut self, _cmd: &str) -> Result<(), EngineError> {
                Ok(())
            }
            fn is_running(&self) -> bool {
                false
            }
        }

        let mut s = SimulationSession::new(RejectingEngine, netlist_with_bc()).unwrap();
        let err = s.start().unwrap_err();
        assert!(matches!(err, SessionError::Engine(_)));
        assert_eq!(s.state(), SessionState::Faulted);
    }

    #[test]
    fn test_restart_resets_and_reruns() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();
        engine.emit(StatusEvent::Progress(80.0));
        s.pause().unwrap();

        s.restart().unwrap();
        assert_eq!(s.state(), SessionState::Running);
        assert_eq!(s.progress(), 0.0);
        // the circuit is reloaded for the second run
        assert_eq!(engine.0.lock().unwrap().loads, 2);
    }

    #[test]
    fn test_restart_only_from_paused() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        assert!(matches!(
            s.restart().unwrap_err(),
            SessionError::InvalidState("idle")
        ));
    }

    #[test]
    fn test_unresponsive_engine_times_out() {
        let engine = FakeEngine::default();
        engine.0.lock().unwrap().mute = true;
        let mut s = SimulationSession::new(engine, netlist_with_bc())
            .unwrap()
            .with_ack_timeout(Duration::from_millis(20));
        let err = s.start().unwrap_err();
        assert!(matches!(err, SessionError::EngineUnresponsive("start")));
    }

    #[test]
    fn test_boundary_callback_answered_while_pausing() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();

        // delay the halt acknowledgement so pause() stays blocked on the
        // condvar while the engine thread keeps asking for data
        engine.0.lock().unwrap().mute = true;
        let hooks = engine.hooks();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let answers = (
                hooks.boundary_value("Vin", 0.5),
                hooks.boundary_value("vin", 0.25),
                hooks.boundary_value("bogus", 0.0),
            );
            hooks.status(StatusEvent::Thread { running: false });
            answers
        });

        s.pause().unwrap();
        let (exact, interp, missing) = worker.join().unwrap();
        assert_eq!(exact, Some(1.0));
        assert_eq!(interp, Some(0.5));
        // unknown names answer neutral zero instead of failing the run
        assert_eq!(missing, Some(0.0));
        assert_eq!(s.state(), SessionState::Paused);

        engine.0.lock().unwrap().mute = false;
        s.resume().unwrap();
    }

    #[test]
    fn test_save_results_switches_and_restores_format() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();
        s.pause().unwrap();

        s.save_results(
            &["v(1)".to_string(), "v(2)".to_string()],
            true,
            "/tmp/out.raw",
        )
        .unwrap();
        let commands = engine.0.lock().unwrap().commands.clone();
        assert_eq!(
            commands,
            vec![
                "set filetype=ascii",
                "write /tmp/out.raw v(1) v(2)",
                "set filetype=binary",
            ]
        );
    }

    #[test]
    fn test_save_requires_results() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        let err = s
            .save_results(&["v(1)".to_string()], true, "/tmp/out.raw")
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState("idle")));
    }

    #[test]
    fn test_plot_results_png() {
        let engine = FakeEngine::default();
        let mut s = session(engine.clone());
        s.start().unwrap();
        engine.emit(StatusEvent::Progress(100.0));
        engine.emit(StatusEvent::Thread { running: false });
        engine.emit(StatusEvent::Exited { ok: true });
        assert_eq!(s.state(), SessionState::Complete);

        s.plot_results(&["v(1)".to_string()], true, "/tmp/plot.png")
            .unwrap();
        let commands = engine.0.lock().unwrap().commands.clone();
        assert_eq!(
            commands,
            vec![
                "set gnuplot_terminal=png",
                "gnuplot /tmp/plot.png v(1)",
                "unset gnuplot_terminal",
            ]
        );
    }

    #[test]
    fn test_observer_sees_progress_and_messages() {
        #[derive(Default)]
        struct Recorder {
            lines: StdMutex<Vec<String>>,
            last: StdMutex<f64>,
        }
        impl SessionObserver for Recorder {
            fn progress(&self, percent: f64) {
                *self.last.lock().unwrap() = percent;
            }
            fn message(&self, line: &str) {
                self.lines.lock().unwrap().push(line.to_string());
            }
        }

        let engine = FakeEngine::default();
        let recorder = Arc::new(Recorder::default());
        let mut s = SimulationSession::with_observer(
            engine.clone(),
            netlist_with_bc(),
            Arc::clone(&recorder) as Arc<dyn SessionObserver>,
        )
        .unwrap();
        s.start().unwrap();
        engine.emit(StatusEvent::Message("tran: 12%".to_string()));
        engine.emit(StatusEvent::Message("note".to_string()));

        assert_eq!(*recorder.last.lock().unwrap(), 12.0);
        assert_eq!(
            *recorder.lines.lock().unwrap(),
            vec!["tran: 12%".to_string(), "note".to_string()]
        );
    }
}
