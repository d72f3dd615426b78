//! Adaptive pool sizing policies.
//!
//! A policy only proposes a target size; the pool clamps it to the
//! configured bounds and applies at most one retirement per idle poll.

use std::fmt;
use std::sync::Arc;

/// Snapshot of a pool's occupancy handed to a [`PoolSizing`] policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLoad {
    /// Live worker threads.
    pub pool_size: usize,
    /// Configured minimum.
    pub min_threads: usize,
    /// Configured maximum.
    pub max_threads: usize,
    /// Items waiting in the queue.
    pub queued: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
}

/// Grow/shrink decision taken from the current load.
pub trait PoolSizing: Send + Sync + fmt::Debug {
    /// Desired number of workers. Values outside the configured bounds are
    /// clamped by the pool.
    fn target_size(&self, load: &PoolLoad) -> usize;
}

/// Grow one worker at a time when the queue is more than half full and
/// shrink one at a time when it is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct Conservative;

impl PoolSizing for Conservative {
    fn target_size(&self, load: &PoolLoad) -> usize {
        if load.queued == 0 {
            return load.pool_size.saturating_sub(1);
        }
        if load.queued.saturating_mul(2) > load.queue_capacity {
            return load.pool_size.saturating_add(1);
        }
        load.pool_size
    }
}

/// Jump to the maximum as soon as work is waiting and shrink towards the
/// minimum when the queue runs dry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggressive;

impl PoolSizing for Aggressive {
    fn target_size(&self, load: &PoolLoad) -> usize {
        if load.queued > 0 {
            load.max_threads
        } else {
            load.pool_size.saturating_sub(1)
        }
    }
}

/// Named selection of the built-in policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizingStrategy {
    /// See [`Conservative`].
    Conservative,
    /// See [`Aggressive`].
    #[default]
    Aggressive,
}

impl SizingStrategy {
    /// Instantiate the selected policy.
    #[must_use]
    pub fn policy(self) -> Arc<dyn PoolSizing> {
        match self {
            Self::Conservative => Arc::new(Conservative),
            Self::Aggressive => Arc::new(Aggressive),
        }
    }
}
