//! Factorization drivers and their option handling
//!
//! Drivers resolve an [`Options`] map at entry (rejecting invalid values
//! before any work is submitted), build their task graph on a
//! [`TaskPool`](crate::schedule::TaskPool), and report non-fatal numeric
//! findings through [`Diagnostics`] and the `tracing` warning channel.

mod getrf_nopiv;

pub use getrf_nopiv::getrf_nopiv;

use crate::error::{Error, Result};
use crate::kernel::Target;
use std::collections::HashMap;

/// Names of the driver options
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OptionKey {
    /// Execution target for the trailing updates
    Target,
    /// Number of panels solved and broadcast eagerly
    Lookahead,
    /// Sub-tile blocking inside panel kernels
    InnerBlocking,
    /// Thread cap for panel factorization
    MaxPanelThreads,
}

/// A tagged option value
#[derive(Copy, Clone, Debug)]
pub enum OptionValue {
    /// Integer-valued option
    Int(i64),
    /// Target-valued option
    Target(Target),
}

/// Option map passed to drivers
///
/// Missing options fall back to documented defaults; options a driver
/// does not consult are ignored. Invalid values fail with
/// `InvalidArgument` at driver entry.
#[derive(Clone, Debug, Default)]
pub struct Options {
    map: HashMap<OptionKey, OptionValue>,
}

impl Options {
    /// Empty option map; every driver option takes its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option
    pub fn set(&mut self, key: OptionKey, value: OptionValue) -> &mut Self {
        self.map.insert(key, value);
        self
    }

    /// Look up an option
    pub fn get(&self, key: OptionKey) -> Option<OptionValue> {
        self.map.get(&key).copied()
    }

    /// Builder-style target
    pub fn with_target(mut self, target: Target) -> Self {
        self.map.insert(OptionKey::Target, OptionValue::Target(target));
        self
    }

    /// Builder-style lookahead
    pub fn with_lookahead(mut self, lookahead: i64) -> Self {
        self.map
            .insert(OptionKey::Lookahead, OptionValue::Int(lookahead));
        self
    }

    /// Builder-style inner blocking
    pub fn with_inner_blocking(mut self, ib: i64) -> Self {
        self.map
            .insert(OptionKey::InnerBlocking, OptionValue::Int(ib));
        self
    }

    /// Builder-style panel thread cap
    pub fn with_max_panel_threads(mut self, threads: i64) -> Self {
        self.map
            .insert(OptionKey::MaxPanelThreads, OptionValue::Int(threads));
        self
    }
}

/// Options after resolution and validation
#[derive(Copy, Clone, Debug)]
pub(crate) struct Resolved {
    pub target: Target,
    pub lookahead: i64,
    pub inner_blocking: i64,
    #[allow(dead_code)]
    pub max_panel_threads: i64,
}

pub(crate) fn resolve(opts: &Options) -> Result<Resolved> {
    let runtime_max = std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1);

    let target = match opts.get(OptionKey::Target) {
        None => Target::HostTask,
        Some(OptionValue::Target(t)) => t,
        Some(other) => {
            return Err(Error::invalid_argument(
                "Target",
                format!("expected a target value, got {other:?}"),
            ))
        }
    };

    let lookahead = match opts.get(OptionKey::Lookahead) {
        None => 1,
        Some(OptionValue::Int(l)) if l >= 0 => l,
        Some(other) => {
            return Err(Error::invalid_argument(
                "Lookahead",
                format!("must be a non-negative integer, got {other:?}"),
            ))
        }
    };

    let inner_blocking = match opts.get(OptionKey::InnerBlocking) {
        None => 16,
        Some(OptionValue::Int(ib)) if ib > 0 => ib,
        Some(other) => {
            return Err(Error::invalid_argument(
                "InnerBlocking",
                format!("must be a positive integer, got {other:?}"),
            ))
        }
    };

    let max_panel_threads = match opts.get(OptionKey::MaxPanelThreads) {
        None => (runtime_max / 2).max(1),
        Some(OptionValue::Int(t)) if t >= 1 && t <= runtime_max => t,
        Some(other) => {
            return Err(Error::invalid_argument(
                "MaxPanelThreads",
                format!("must be in 1..={runtime_max}, got {other:?}"),
            ))
        }
    };

    Ok(Resolved {
        target,
        lookahead,
        inner_blocking,
        max_panel_threads,
    })
}

/// One row interchange recorded by a pivoted panel
///
/// The non-pivoted driver records none, but the type keeps the kernel
/// contract uniform across the pivoted and non-pivoted variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pivot {
    /// Row the panel examined
    pub row: i64,
    /// Row it was swapped with
    pub swap_row: i64,
}

/// Non-fatal findings from a driver call
///
/// Singular diagonals are reported here (and as `tracing` warnings)
/// rather than as errors; the factorization runs to completion and the
/// overwritten matrix is returned as-is. Entries reflect what this
/// process observed; only the rank owning a diagonal tile sees its
/// zero diagonals.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    /// Global column indices with an exactly zero diagonal, ascending
    pub singular_columns: Vec<i64>,
    /// Row interchanges per panel column; empty lists for the
    /// non-pivoted driver
    pub pivots: Vec<Vec<Pivot>>,
}

impl Diagnostics {
    /// True when any zero diagonal was observed
    pub fn is_singular(&self) -> bool {
        !self.singular_columns.is_empty()
    }
}
