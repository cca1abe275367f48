//! Core domain types
//!
//! This module contains the domain structures shared between the compile
//! service's components (registry, worker pool, sweeper, API layer). These
//! represent the tracked state of a compile job, not its wire encoding.

pub mod job;
