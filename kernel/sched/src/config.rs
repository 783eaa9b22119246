//! Boot-time kernel configuration.

use tessera_core::cpu_local::MAX_CPUS;
use tessera_core::log::LogLevel;

use crate::error::ConfigError;

/// Default upper bound on handed-out process identifiers.
pub const DEFAULT_PID_LIMIT: u32 = 65536;

/// Default preemption quantum in platform clock ticks.
pub const DEFAULT_QUANTUM: u64 = 10;

/// Parameters fixed when the [`Kernel`](crate::Kernel) is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of cores, each with an idle sentinel and a preemption timer.
    pub cpus: usize,
    /// Preemption timer period in platform clock ticks.
    pub quantum: u64,
    /// Whether kernel locks mask interrupts while held.
    pub irq_safe_locks: bool,
    /// Largest process identifier that will ever be handed out.
    pub pid_limit: u32,
    /// Most verbose log level forwarded to the log sink.
    pub log_level: LogLevel,
}

impl KernelConfig {
    /// Returns the default configuration for `cpus` cores.
    pub const fn new(cpus: usize) -> Self {
        Self {
            cpus,
            quantum: DEFAULT_QUANTUM,
            irq_safe_locks: true,
            pid_limit: DEFAULT_PID_LIMIT,
            log_level: LogLevel::Info,
        }
    }

    /// Sets the preemption quantum.
    #[must_use]
    pub const fn with_quantum(mut self, quantum: u64) -> Self {
        self.quantum = quantum;
        self
    }

    /// Chooses whether kernel locks mask interrupts.
    #[must_use]
    pub const fn with_irq_safe_locks(mut self, irq_safe: bool) -> Self {
        self.irq_safe_locks = irq_safe;
        self
    }

    /// Sets the largest process identifier.
    #[must_use]
    pub const fn with_pid_limit(mut self, limit: u32) -> Self {
        self.pid_limit = limit;
        self
    }

    /// Sets the log verbosity applied at boot.
    #[must_use]
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Checks that the configuration describes a bootable kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus(self.cpus));
        }
        if self.quantum == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        if self.pid_limit == 0 {
            return Err(ConfigError::ZeroPidLimit);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new(1)
    }
}
