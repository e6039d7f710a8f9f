//! Resource tracking for the evaluator's host-provided interrupt/limit hooks.
//!
//! The language core treats the garbage collector as an external dependency
//! (see design note §1); this module models the companion "host can stop me" half
//! of that contract (design note §5): an interrupt flag checked at back-edges, an
//! optional recursion ceiling, and a soft allocation/time budget. None of this
//! is mandated by the core language semantics, but a real evaluator needs
//! somewhere to hang it, and the VM's main loop calls into it at `Jmp`/`Bt`/`Bf`
//! back-edges and at every `Begin` (closure push).

use std::time::{Duration, Instant};

/// Error returned when a resource limit is exceeded during execution.
#[derive(Debug, Clone)]
pub enum ResourceError {
    Allocation { limit: usize, count: usize },
    Operation { limit: usize, count: usize },
    Time { limit: Duration, elapsed: Duration },
    Memory { limit: usize, used: usize },
    Recursion { limit: usize, depth: usize },
    Interrupted,
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allocation { limit, count } => write!(f, "allocation limit exceeded: {count} > {limit}"),
            Self::Operation { limit, count } => write!(f, "operation limit exceeded: {count} > {limit}"),
            Self::Time { limit, elapsed } => write!(f, "time limit exceeded: {elapsed:?} > {limit:?}"),
            Self::Memory { limit, used } => write!(f, "memory limit exceeded: {used} bytes > {limit} bytes"),
            Self::Recursion { limit, depth } => write!(f, "recursion depth exceeded: {depth} > {limit}"),
            Self::Interrupted => write!(f, "execution interrupted by host"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Recommended maximum recursion depth (closure-chain depth) if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 10_000;

/// Suggested recursion-depth bound for host-side data-structure traversals
/// (e.g. printing). Separate from the call-stack limit. Deep/structural
/// equality (`natives::structural_eq`) does not use this: it tracks visited
/// `HeapId` pairs instead, so it terminates correctly on cyclic structures
/// rather than merely bailing out past some depth.
#[cfg(debug_assertions)]
pub const MAX_DATA_RECURSION_DEPTH: u16 = 200;
#[cfg(not(debug_assertions))]
pub const MAX_DATA_RECURSION_DEPTH: u16 = 1000;

/// Called before each heap allocation, at each back-edge branch, and before
/// pushing a new local `Closure`. Implementations can enforce limits or simply
/// accept everything (`NoLimitTracker`).
pub trait ResourceTracker: std::fmt::Debug {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);
    fn check_time(&mut self) -> Result<(), ResourceError>;
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    fn allocation_count(&self) -> Option<usize> {
        None
    }
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// Configuration for resource limits. `None` disables a given limit.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub max_operations: Option<usize>,
    pub max_allocations: Option<usize>,
    pub max_duration: Option<Duration>,
    pub max_memory: Option<usize>,
    pub max_recursion_depth: Option<usize>,
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }

    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, limit: usize) -> Self {
        self.max_recursion_depth = Some(limit);
        self
    }
}

/// No-op tracker: the VM runs with no host-imposed limits beyond the
/// unconditional default recursion ceiling (which exists to turn stack
/// overflows into catchable `RecursionError`s rather than process aborts).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct NoLimitTracker {
    operation_count: usize,
}

pub const NO_LIMIT_TRACKER: NoLimitTracker = NoLimitTracker { operation_count: 0 };

impl ResourceTracker for NoLimitTracker {
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}

    fn check_time(&mut self) -> Result<(), ResourceError> {
        self.operation_count += 1;
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= DEFAULT_MAX_RECURSION_DEPTH {
            Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
                depth: current_depth + 1,
            })
        } else {
            Ok(())
        }
    }
}

/// A tracker that enforces configurable limits: allocation count, wall-clock
/// time, operation count, and recursion depth.
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    start_time: Instant,
    allocation_count: usize,
    operation_count: usize,
    current_memory: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
            allocation_count: 0,
            operation_count: 0,
            current_memory: 0,
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }
        let size = get_size();
        if let Some(max) = self.limits.max_memory {
            let new_memory = self.current_memory + size;
            if new_memory > max {
                return Err(ResourceError::Memory { limit: max, used: new_memory });
            }
        }
        self.allocation_count += 1;
        self.current_memory += size;
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.current_memory = self.current_memory.saturating_sub(get_size());
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_operations {
            self.operation_count += 1;
            if self.operation_count > max {
                return Err(ResourceError::Operation {
                    limit: max,
                    count: self.operation_count,
                });
            }
        }
        if let Some(max) = self.limits.max_duration {
            let elapsed = self.start_time.elapsed();
            if elapsed > max {
                return Err(ResourceError::Time { limit: max, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        let max = self.limits.max_recursion_depth.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH);
        if current_depth >= max {
            Err(ResourceError::Recursion {
                limit: max,
                depth: current_depth + 1,
            })
        } else {
            Ok(())
        }
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}
