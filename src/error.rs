use thiserror::Error;

/// Structural errors detected while compiling a topology graph into a
/// netlist. All of these are recoverable: the caller fixes the diagram
/// and compiles again. The name/value variants are found by a pre-pass
/// over every placed element before traversal starts.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no ground element placed, nowhere to start numbering")]
    NoStart,
    #[error("circuit is incomplete: {0} unreachable from ground")]
    Incomplete(String),
    #[error("element '{0}' has no value or external file")]
    NoValue(String),
    #[error("element of kind '{0}' has no name")]
    NoName(String),
    #[error("duplicate element name '{0}'")]
    DuplicateName(String),
    #[error(transparent)]
    Waveform(#[from] WaveformError),
}

/// Format and resource errors raised while constructing a waveform table
/// from a two-column sample file.
#[derive(Debug, Error)]
pub enum WaveformError {
    #[error("cannot open waveform file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line} of '{path}' is not '<time> <value>'")]
    Format { path: String, line: usize },
    #[error("'{0}' holds fewer than two samples, interpolation undefined")]
    TooFewSamples(String),
    #[error("period must be positive, got {0}")]
    BadPeriod(f64),
}

/// Format and resource errors for netlist files supplied from outside
/// (the noGUI path) or written by us.
#[derive(Debug, Error)]
pub enum NetlistError {
    #[error("cannot access netlist file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("netlist line {line} is malformed: {reason}")]
    Format { line: usize, reason: String },
    #[error("element '{0}' requires an external waveform but none was supplied")]
    MissingBoundaryCondition(String),
    #[error(transparent)]
    Waveform(#[from] WaveformError),
}

/// Errors reported by the external engine when a command is dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine rejected command '{0}'")]
    Rejected(String),
    #[error("engine failed to load circuit: {0}")]
    LoadFailed(String),
}

/// Errors surfaced to the controller by a simulation session. Engine
/// faults are latched by the callback handlers and returned from the
/// next command, never thrown across the callback boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation invalid in state {0}")]
    InvalidState(&'static str),
    #[error("engine fault: {0}")]
    EngineFault(String),
    #[error("engine did not acknowledge '{0}' in time")]
    EngineUnresponsive(&'static str),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Framing and resource errors for the legacy binary handoff files.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("cannot access handoff file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad record framing at offset {0}")]
    Framing(u64),
    #[error("record length {got} does not match payload size {want}")]
    Length { got: i32, want: i32 },
}
