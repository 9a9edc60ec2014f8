//! Query circuit breaker and per-operation RAM accounting.
//!
//! A [`CircuitBreaker`] is the process-wide budget. Operations never touch it
//! directly; they get an [`AccountingContext`] from
//! [`CircuitBreaker::context_for`] (one per merge group or collect unit),
//! account bytes against it while they buffer rows, and give everything back
//! when the context is dropped.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{FanoutError, Result, UnitId};

/// Shared byte budget.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    limit_bytes: usize,
    used_bytes: AtomicUsize,
}

impl CircuitBreaker {
    /// Create a breaker; `usize::MAX` effectively disables tripping.
    #[must_use]
    pub fn new(name: impl Into<String>, limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limit_bytes,
            used_bytes: AtomicUsize::new(0),
        })
    }

    /// Breaker without a limit.
    #[must_use]
    pub fn unlimited(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, usize::MAX)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Bytes currently accounted by live contexts.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Accounting context for one operation of `unit`.
    #[must_use]
    pub fn context_for(self: &Arc<Self>, unit: UnitId, operation: &str) -> AccountingContext {
        AccountingContext {
            breaker: Arc::clone(self),
            unit,
            operation: operation.to_string(),
            reserved_bytes: AtomicUsize::new(0),
        }
    }

    fn try_add(&self, bytes: usize) -> Result<()> {
        loop {
            let current = self.used_bytes.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.limit_bytes {
                return Err(FanoutError::CircuitBreaking {
                    breaker: self.name.clone(),
                    message: format!(
                        "data too large, would be {next} bytes, limit is {} bytes",
                        self.limit_bytes
                    ),
                });
            }
            if self
                .used_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn release(&self, bytes: usize) {
        if bytes > 0 {
            self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }
}

/// RAII accounting handle that releases its bytes on drop.
pub struct AccountingContext {
    breaker: Arc<CircuitBreaker>,
    unit: UnitId,
    operation: String,
    reserved_bytes: AtomicUsize,
}

impl AccountingContext {
    /// Account `bytes` more; fails without reserving if the breaker would trip.
    pub fn add_bytes(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.breaker.try_add(bytes).map_err(|e| match e {
            FanoutError::CircuitBreaking { breaker, message } => FanoutError::CircuitBreaking {
                breaker,
                message: format!("{message} (unit {} {})", self.unit, self.operation),
            },
            other => other,
        })?;
        self.reserved_bytes.fetch_add(bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Bytes accounted by this context so far.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl fmt::Debug for AccountingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountingContext")
            .field("breaker", &self.breaker.name)
            .field("unit", &self.unit)
            .field("operation", &self.operation)
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

impl Drop for AccountingContext {
    fn drop(&mut self) {
        self.breaker.release(*self.reserved_bytes.get_mut());
    }
}
