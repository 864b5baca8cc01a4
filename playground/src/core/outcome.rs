use serde::Serialize;
use std::fmt;

/// Which ceiling stopped a timed-out stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLimit {
    Wall,
    Cpu,
}

/// How a stage's process tree ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exited on its own with the given code
    Exited(i32),
    /// Killed by a signal it did not ask for (e.g. `SIGSEGV`)
    Signaled(String),
    TimedOut(TimeLimit),
    OutOfMemory,
}

/// Signal reported for stages the sandbox killed on our behalf
pub const KILL_SIGNAL: &str = "SIGKILL";

impl Outcome {
    /// Exit code as reported to clients (`null` unless the process exited)
    pub fn code(&self) -> Option<i32> {
        match self {
            Outcome::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Terminating signal as reported to clients
    pub fn signal(&self) -> Option<&str> {
        match self {
            Outcome::Exited(_) => None,
            Outcome::Signaled(name) => Some(name),
            Outcome::TimedOut(_) | Outcome::OutOfMemory => Some(KILL_SIGNAL),
        }
    }

    /// Short status tag; `None` for a normal exit
    pub fn status(&self) -> Option<&'static str> {
        match self {
            Outcome::Exited(_) => None,
            Outcome::Signaled(_) => Some("signaled"),
            Outcome::TimedOut(TimeLimit::Wall) => Some("wall_timeout"),
            Outcome::TimedOut(TimeLimit::Cpu) => Some("cpu_timeout"),
            Outcome::OutOfMemory => Some("out_of_memory"),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Exited(0))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exited(code) => write!(f, "exited with code {}", code),
            Outcome::Signaled(name) => write!(f, "killed by {}", name),
            Outcome::TimedOut(TimeLimit::Wall) => write!(f, "wall-clock time limit exceeded"),
            Outcome::TimedOut(TimeLimit::Cpu) => write!(f, "CPU time limit exceeded"),
            Outcome::OutOfMemory => write!(f, "memory limit exceeded"),
        }
    }
}

/// Conventional name for a signal number (`SIG<n>` when unknown)
pub fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}
