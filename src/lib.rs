pub mod context;
pub mod driver;
pub mod host;
pub mod parallel_sum;
pub mod plan;
pub mod transfer;

pub use context::ComputeContext;
pub use parallel_sum::ParallelSum;
pub use plan::{ReduceConfig, ReductionPlan};

/// Broad classes of failure, for reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
	/// No usable device, or the device cannot be set up for the configuration.
	Setup,
	/// A stage pipeline failed to build.
	Build,
	/// Recording, submitting or executing device work failed.
	Dispatch,
	/// The input cannot be reduced without truncation.
	Precondition,
}
