//! The lag computation engine: one task per consumer group, fanned out across
//! every connected cluster.

pub mod assignment_resolver;
pub mod cycle;
pub mod group_enumerator;
pub mod lag_calculator;
pub mod offset_fetcher;

pub use cycle::{CycleReport, CycleRunner};
