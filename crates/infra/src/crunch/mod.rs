//! The crunch job: resolve a dimension, aggregate its scope, write a rollup.
//!
//! Every step runs inside the transaction opened at windup; the job's outcome
//! decides once whether that transaction commits or rolls back.

pub mod cruncher;
pub mod resolver;
pub mod writer;

pub use cruncher::{CrunchState, Cruncher};
pub use resolver::resolve;
pub use writer::write_rollup;
