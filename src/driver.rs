use crate::plan::{BufferRole, Dispatch, ReductionPlan};

/// The two stage kernels of a parallel sum, as implemented by a backend.
///
/// Both stages are stateless: their output depends only on the dispatch shape
/// and the contents of `vals`. Lane `l` of work group `g` owns the
/// `lane_width` consecutive values starting at `(g * work_group_size + l) *
/// lane_width`.
pub trait ReduceStages {
	type Buffer: Clone;
	type Error;

	/// Folds every work group of `dispatch.work_group_size` lanes into one
	/// lane, writing `dispatch.results_len` values to `partials`.
	fn partial_reduce(
		&mut self,
		dispatch: &Dispatch,
		vals: &Self::Buffer,
		partials: &Self::Buffer,
	) -> Result<(), Self::Error>;

	/// Folds the single work group, whose first `dispatch.num_lanes` lanes
	/// load values and whose other lanes load zeros, then the components of
	/// the remaining lane, writing the scalar to `sum`.
	fn terminal_reduce(
		&mut self,
		dispatch: &Dispatch,
		vals: &Self::Buffer,
		sum: &Self::Buffer,
	) -> Result<(), Self::Error>;
}

/// Runs (or records) all dispatches of `plan`, ping-ponging between
/// `vals_buffer` and `aux_buffer`.
///
/// Returns the role of the buffer the terminal pass read from. `aux_buffer`
/// is never touched if the plan has no partial passes.
pub fn reduce<S: ReduceStages>(
	stages: &mut S,
	plan: &ReductionPlan,
	vals_buffer: &S::Buffer,
	aux_buffer: &S::Buffer,
	sum_buffer: &S::Buffer,
) -> Result<BufferRole, S::Error> {
	let buffer = |role: BufferRole| match role {
		BufferRole::Vals => vals_buffer,
		BufferRole::Aux => aux_buffer,
	};

	for (index, pass) in plan.passes().iter().enumerate() {
		let input = ReductionPlan::input_role(index);
		log::debug!(
			"Partial pass {index}: {} lanes, {} lanes per work group, {} work groups ({input:?} -> {:?})",
			pass.num_lanes,
			pass.work_group_size,
			pass.num_work_groups,
			input.swapped(),
		);
		stages.partial_reduce(pass, buffer(input), buffer(input.swapped()))?;
	}

	let input = plan.terminal_role();
	let terminal = plan.terminal();
	log::debug!(
		"Terminal pass: {} lanes in a single work group ({input:?} -> sum)",
		terminal.num_lanes,
	);
	stages.terminal_reduce(terminal, buffer(input), sum_buffer)?;

	Ok(input)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan::ReduceConfig;

	#[derive(Debug, PartialEq, Eq)]
	enum Recorded {
		Partial(u64, &'static str, &'static str),
		Terminal(u64, &'static str),
	}

	#[derive(Default)]
	struct Recorder(Vec<Recorded>);

	impl ReduceStages for Recorder {
		type Buffer = &'static str;
		type Error = crate::plan::Error;

		fn partial_reduce(
			&mut self,
			dispatch: &Dispatch,
			vals: &&'static str,
			partials: &&'static str,
		) -> Result<(), Self::Error> {
			self.0
				.push(Recorded::Partial(dispatch.num_lanes, *vals, *partials));
			Ok(())
		}

		fn terminal_reduce(
			&mut self,
			dispatch: &Dispatch,
			vals: &&'static str,
			sum: &&'static str,
		) -> Result<(), Self::Error> {
			assert_eq!(*sum, "sum");
			self.0.push(Recorded::Terminal(dispatch.num_lanes, *vals));
			Ok(())
		}
	}

	#[test]
	fn ping_pong() {
		let plan = ReductionPlan::new(1024 * 1024, ReduceConfig::default()).unwrap();
		let mut recorder = Recorder::default();

		let role = reduce(&mut recorder, &plan, &"vals", &"aux", &"sum").unwrap();

		assert_eq!(role, BufferRole::Aux);
		assert_eq!(
			recorder.0,
			[
				Recorded::Partial(262144, "vals", "aux"),
				Recorded::Partial(8192, "aux", "vals"),
				Recorded::Partial(256, "vals", "aux"),
				Recorded::Terminal(8, "aux"),
			]
		);
	}

	#[test]
	fn terminal_only() {
		let plan = ReductionPlan::new(64, ReduceConfig::default()).unwrap();
		let mut recorder = Recorder::default();

		let role = reduce(&mut recorder, &plan, &"vals", &"aux", &"sum").unwrap();

		assert_eq!(role, BufferRole::Vals);
		assert_eq!(recorder.0, [Recorded::Terminal(16, "vals")]);
	}
}
