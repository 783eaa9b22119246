//! Error types for process management and boot configuration.

use core::fmt;

/// Recoverable process-management failures.
///
/// Internal consistency violations are not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// No page or block was available for a new process.
    OutOfMemory,
    /// Every process identifier up to the configured limit has been used.
    PidsExhausted,
    /// `wait` was called by a process without children.
    NoChildren,
    /// `kill` named a pid that is absent from the tree or never started.
    NotFound,
    /// `kill` named the root process, which outlives every other process.
    Protected,
    /// A blocking call was abandoned because the caller was killed.
    Killed,
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory for process"),
            Self::PidsExhausted => write!(f, "process identifiers exhausted"),
            Self::NoChildren => write!(f, "no children to wait for"),
            Self::NotFound => write!(f, "no such process"),
            Self::Protected => write!(f, "the root process cannot be killed"),
            Self::Killed => write!(f, "process was killed"),
        }
    }
}

/// Invalid [`KernelConfig`](crate::config::KernelConfig) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one CPU is required.
    NoCpus,
    /// More CPUs than per-CPU storage can index.
    TooManyCpus(usize),
    /// The preemption quantum must be at least one tick.
    ZeroQuantum,
    /// The pid limit must leave room for the root process.
    ZeroPidLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCpus => write!(f, "at least one cpu is required"),
            Self::TooManyCpus(n) => write!(f, "{n} cpus exceeds the supported maximum"),
            Self::ZeroQuantum => write!(f, "preemption quantum must be non-zero"),
            Self::ZeroPidLimit => write!(f, "pid limit must be non-zero"),
        }
    }
}

/// Failures while bringing up a [`Kernel`](crate::Kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// The root process could not be created.
    Root(ProcError),
}

impl From<ConfigError> for BootError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ProcError> for BootError {
    fn from(err: ProcError) -> Self {
        Self::Root(err)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid kernel config: {err}"),
            Self::Root(err) => write!(f, "cannot create root process: {err}"),
        }
    }
}
