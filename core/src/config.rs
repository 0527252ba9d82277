//! Broker tunables.
//!
//! All options are runtime-mutable through the admin surface; reads happen
//! when a barrier is armed, so a change takes effect on the next barrier.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Time unit used when rendering barrier timings in metrics snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitScale {
    Ms,
    Us,
    Ns,
}

impl UnitScale {
    pub(crate) fn from_nanos(self, nanos: u64) -> f64 {
        match self {
            Self::Ms => nanos as f64 / 1_000_000.0,
            Self::Us => nanos as f64 / 1_000.0,
            Self::Ns => nanos as f64,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Ms => 0,
            Self::Us => 1,
            Self::Ns => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Us,
            2 => Self::Ns,
            _ => Self::Ms,
        }
    }
}

/// Strategy for selecting the SPUs an update could possibly affect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Every live SPU participates in every barrier. Always correct.
    All,
    /// Graph-URI intersection lookup. Conservative: an SPU is only skipped
    /// when its graph set and the update's using set are both non-empty and
    /// disjoint, so no SPU whose result set could change is ever omitted.
    Lut,
}

impl FilterMode {
    fn as_u8(self) -> u8 {
        match self {
            Self::All => 0,
            Self::Lut => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Lut,
            _ => Self::All,
        }
    }
}

pub struct BrokerConfig {
    spu_processing_timeout_ms: AtomicU64,
    endpoint_retry_budget: AtomicU32,
    unit_scale: AtomicU8,
    filter_mode: AtomicU8,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            spu_processing_timeout_ms: AtomicU64::new(5000),
            endpoint_retry_budget: AtomicU32::new(0),
            unit_scale: AtomicU8::new(UnitScale::Ms.as_u8()),
            filter_mode: AtomicU8::new(FilterMode::All.as_u8()),
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self { Self::default() }

    pub fn with_spu_processing_timeout(self, timeout: Duration) -> Self {
        self.set_spu_processing_timeout(timeout);
        self
    }

    pub fn with_endpoint_retry_budget(self, budget: u32) -> Self {
        self.set_endpoint_retry_budget(budget);
        self
    }

    pub fn with_unit_scale(self, scale: UnitScale) -> Self {
        self.set_unit_scale(scale);
        self
    }

    pub fn with_filter_mode(self, mode: FilterMode) -> Self {
        self.set_filter_mode(mode);
        self
    }

    /// Per-SPU barrier budget. The pre-update barrier waits this long per
    /// pool member; the post-update barrier waits this long in total.
    pub fn spu_processing_timeout(&self) -> Duration { Duration::from_millis(self.spu_processing_timeout_ms.load(Ordering::Relaxed)) }

    /// Updates the timeout and nothing else.
    pub fn set_spu_processing_timeout(&self, timeout: Duration) {
        self.spu_processing_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// How many times a failed endpoint mutation is re-attempted.
    pub fn endpoint_retry_budget(&self) -> u32 { self.endpoint_retry_budget.load(Ordering::Relaxed) }

    pub fn set_endpoint_retry_budget(&self, budget: u32) { self.endpoint_retry_budget.store(budget, Ordering::Relaxed); }

    pub fn unit_scale(&self) -> UnitScale { UnitScale::from_u8(self.unit_scale.load(Ordering::Relaxed)) }

    pub fn set_unit_scale(&self, scale: UnitScale) { self.unit_scale.store(scale.as_u8(), Ordering::Relaxed); }

    pub fn filter_mode(&self) -> FilterMode { FilterMode::from_u8(self.filter_mode.load(Ordering::Relaxed)) }

    pub fn set_filter_mode(&self, mode: FilterMode) { self.filter_mode.store(mode.as_u8(), Ordering::Relaxed); }
}
