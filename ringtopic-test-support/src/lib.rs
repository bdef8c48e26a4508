//! # ringtopic-test-support
//!
//! Testing infrastructure for ringtopic.
//!
//! ## Components
//!
//! - **StressRunner** - Time-boxed multi-producer, multi-subscriber topic runs
//! - **SequenceChecker** - Verifies gap-free, in-order delivery from one source
//! - **PartitionedChecker** - One `SequenceChecker` per producer for tagged values

pub mod stress;
pub mod verify;

pub use stress::{print_summary, StressConfig, StressMetrics, StressRunner};
pub use verify::{tag, untag, PartitionedChecker, SequenceChecker};
