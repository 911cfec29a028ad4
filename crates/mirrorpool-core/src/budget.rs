//! Resource budget tracking
//!
//! A [`BudgetTracker`] reports the memory margin the admission controller may
//! hand out to concurrent uploads. Failures are reported as errors, never as
//! a zero margin, so the caller can tell "no memory" from "cannot measure".

use mirrorpool_common::config::{AdmissionConfig, BudgetSource};
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::System;

/// Error raised when the budget cannot be determined
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("memory probe failed: {0}")]
    Probe(String),
}

/// Source of the memory margin used for admission
pub trait BudgetTracker: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Total bytes that active upload estimates may occupy right now
    fn available_margin(&self) -> Result<u64, BudgetError>;

    /// Largest margin this tracker can ever report
    ///
    /// An upload whose estimate exceeds it can never be admitted.
    fn ceiling(&self) -> Result<u64, BudgetError> {
        self.available_margin()
    }
}

/// A constant budget
#[derive(Debug, Clone)]
pub struct FixedBudget {
    bytes: u64,
}

impl FixedBudget {
    pub const fn new(bytes: u64) -> Self {
        Self { bytes }
    }
}

impl BudgetTracker for FixedBudget {
    fn name(&self) -> &str {
        "fixed"
    }

    fn available_margin(&self) -> Result<u64, BudgetError> {
        Ok(self.bytes)
    }
}

/// A share of the host's physical memory, measured with `sysinfo`
///
/// The margin is `total × fraction`, lowered to what the host reports as
/// available when memory is tighter than that.
pub struct SystemMemoryBudget {
    fraction: f64,
    system: Mutex<System>,
}

impl SystemMemoryBudget {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction,
            system: Mutex::new(System::new()),
        }
    }

    /// Current `(total, available)` host memory in bytes
    fn measure(&self) -> Result<(u64, u64), BudgetError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(BudgetError::Probe(
                "host memory is not reported on this platform".to_string(),
            ));
        }
        Ok((total, system.available_memory()))
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn share(&self, total: u64) -> u64 {
        (total as f64 * self.fraction) as u64
    }
}

impl std::fmt::Debug for SystemMemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemoryBudget")
            .field("fraction", &self.fraction)
            .finish_non_exhaustive()
    }
}

impl BudgetTracker for SystemMemoryBudget {
    fn name(&self) -> &str {
        "system"
    }

    fn available_margin(&self) -> Result<u64, BudgetError> {
        let (total, available) = self.measure()?;
        Ok(self.share(total).min(available))
    }

    fn ceiling(&self) -> Result<u64, BudgetError> {
        let (total, _) = self.measure()?;
        Ok(self.share(total))
    }
}

/// Build the tracker selected by the admission configuration
pub fn budget_from_config(config: &AdmissionConfig) -> Arc<dyn BudgetTracker> {
    match config.budget_source {
        BudgetSource::Fixed => Arc::new(FixedBudget::new(config.memory_budget_bytes)),
        BudgetSource::System => Arc::new(SystemMemoryBudget::new(config.system_memory_fraction)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_budget() {
        let budget = FixedBudget::new(42);
        assert_eq!(budget.available_margin().unwrap(), 42);
        assert_eq!(budget.ceiling().unwrap(), 42);
    }

    #[test]
    fn test_system_budget_measures_host() {
        let budget = SystemMemoryBudget::new(0.5);
        let ceiling = budget.ceiling().unwrap();
        let margin = budget.available_margin().unwrap();
        assert!(ceiling > 0);
        assert!(margin <= ceiling);

        let (total, _) = budget.measure().unwrap();
        assert!(ceiling <= total / 2 + 1);
    }

    #[test]
    fn test_budget_from_config() {
        let mut config = AdmissionConfig {
            memory_budget_bytes: 7,
            ..AdmissionConfig::default()
        };
        assert_eq!(budget_from_config(&config).name(), "fixed");
        assert_eq!(budget_from_config(&config).available_margin().unwrap(), 7);

        config.budget_source = BudgetSource::System;
        assert_eq!(budget_from_config(&config).name(), "system");
    }
}
