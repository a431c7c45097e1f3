//! Pass planning for the multi-pass parallel sum.
//!
//! A reduction over `vals_len` values runs `vals_len / lane_width` lanes. Each
//! partial pass folds every work group of `work_group_size` lanes into a
//! single lane, so the lane count shrinks by `work_group_size` per pass until
//! one work group can finish the job in the terminal pass.

/// Work group shape shared by the partial and terminal stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReduceConfig {
	/// Number of lanes that cooperate on one tree reduction. Must be a power
	/// of two, and at least 2.
	pub work_group_size: u32,
	/// Number of consecutive values owned by each lane.
	pub lane_width: u32,
}

impl Default for ReduceConfig {
	fn default() -> Self {
		Self {
			work_group_size: 32,
			lane_width: 4,
		}
	}
}

impl ReduceConfig {
	/// Checks that the configuration describes a work group that halves
	/// cleanly at every tree step.
	pub fn validate(&self) -> Result<(), Error> {
		if self.work_group_size < 2 || !self.work_group_size.is_power_of_two() {
			return Err(Error::InvalidWorkGroupSize(self.work_group_size));
		}
		if self.lane_width == 0 {
			return Err(Error::InvalidLaneWidth(self.lane_width));
		}
		// `scratch_len` and `scratch_size` rely on this.
		self.work_group_size
			.checked_mul(self.lane_width)
			.and_then(|len| len.checked_mul(size_of::<f32>() as u32))
			.ok_or(Error::ScratchOverflow {
				work_group_size: self.work_group_size,
				lane_width: self.lane_width,
			})?;
		Ok(())
	}

	/// Returns the number of `f32`s of scratch memory a work group of
	/// `work_group_size` lanes needs. `work_group_size` must not exceed the
	/// validated one.
	pub fn scratch_len(&self, work_group_size: u32) -> u32 {
		work_group_size * self.lane_width
	}

	/// Returns the scratch memory size in bytes for a work group of
	/// `work_group_size` lanes.
	pub fn scratch_size(&self, work_group_size: u32) -> u64 {
		self.scratch_len(work_group_size) as u64 * size_of::<f32>() as u64
	}
}

/// The error type that can be returned while planning a reduction.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("The work group size must be a power of two of at least 2, got {0}")]
	InvalidWorkGroupSize(u32),
	#[error("The lane width must be at least 1, got {0}")]
	InvalidLaneWidth(u32),
	#[error("The values buffer is empty")]
	ValsEmpty,
	#[error("{vals_len} values cannot be split into lanes of {lane_width}")]
	UnalignedValues { vals_len: u64, lane_width: u32 },
	#[error("Pass {pass} has {num_lanes} lanes, not a multiple of the work group size {work_group_size}")]
	IndivisiblePass {
		pass: usize,
		num_lanes: u64,
		work_group_size: u32,
	},
	#[error("A work group of {work_group_size} lanes of width {lane_width} needs more scratch memory than fits in 32 bits")]
	ScratchOverflow { work_group_size: u32, lane_width: u32 },
	#[error("Pass {pass} needs {num_work_groups} work groups, more than a single dispatch allows")]
	TooManyWorkGroups { pass: usize, num_work_groups: u64 },
}

/// Which of the two ping-ponged buffers a dispatch reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferRole {
	/// The caller's values buffer, holding the input of the first pass.
	Vals,
	/// The auxiliary buffer, holding the output of the first pass.
	Aux,
}

impl BufferRole {
	/// Returns the role of the other buffer.
	pub fn swapped(self) -> Self {
		match self {
			Self::Vals => Self::Aux,
			Self::Aux => Self::Vals,
		}
	}
}

/// The shape of one compute dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatch {
	/// Number of `f32`s read.
	pub vals_len: u64,
	/// Number of lanes that load values. The terminal dispatch may run fewer
	/// lanes than its work group size; the rest contribute zeros.
	pub num_lanes: u64,
	/// Number of lanes per work group.
	pub work_group_size: u32,
	/// Number of work groups dispatched.
	pub num_work_groups: u32,
	/// Scratch memory per work group, in bytes.
	pub scratch_size: u64,
	/// Number of `f32`s written.
	pub results_len: u64,
}

/// The full sequence of dispatches that sums `vals_len` values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReductionPlan {
	config: ReduceConfig,
	passes: Vec<Dispatch>,
	terminal: Dispatch,
}

impl ReductionPlan {
	/// Plans the reduction of `vals_len` values, or reports why the values
	/// cannot be reduced without truncation.
	pub fn new(vals_len: u64, config: ReduceConfig) -> Result<Self, Error> {
		config.validate()?;

		if vals_len == 0 {
			return Err(Error::ValsEmpty);
		}

		let lane_width = config.lane_width as u64;
		let work_group_size = config.work_group_size as u64;
		if vals_len % lane_width != 0 {
			return Err(Error::UnalignedValues {
				vals_len,
				lane_width: config.lane_width,
			});
		}

		let mut num_lanes = vals_len / lane_width;
		let max_depth = max_depth(num_lanes, work_group_size);
		let mut passes = Vec::with_capacity(max_depth);

		// Lanes shrink by a factor of at least 2 per iteration.
		while num_lanes > work_group_size {
			let pass = passes.len();
			if num_lanes % work_group_size != 0 {
				return Err(Error::IndivisiblePass {
					pass,
					num_lanes,
					work_group_size: config.work_group_size,
				});
			}

			let num_work_groups = num_lanes / work_group_size;
			passes.push(Dispatch {
				vals_len: num_lanes * lane_width,
				num_lanes,
				work_group_size: config.work_group_size,
				num_work_groups: u32::try_from(num_work_groups)
					.map_err(|_| Error::TooManyWorkGroups {
						pass,
						num_work_groups,
					})?,
				scratch_size: config.scratch_size(config.work_group_size),
				results_len: num_work_groups * lane_width,
			});
			num_lanes = num_work_groups;
		}
		debug_assert!(passes.len() <= max_depth);

		// Between 1 and `work_group_size` lanes remain. The terminal work group
		// is always full size, so any remaining count fits.
		let terminal = Dispatch {
			vals_len: num_lanes * lane_width,
			num_lanes,
			work_group_size: config.work_group_size,
			num_work_groups: 1,
			scratch_size: config.scratch_size(config.work_group_size),
			results_len: 1,
		};

		Ok(Self {
			config,
			passes,
			terminal,
		})
	}

	pub fn config(&self) -> ReduceConfig {
		self.config
	}

	/// Returns the number of `f32`s in the reduced values buffer.
	pub fn vals_len(&self) -> u64 {
		self.passes
			.first()
			.map_or(self.terminal.vals_len, |pass| pass.vals_len)
	}

	/// Returns the partial passes, in dispatch order.
	pub fn passes(&self) -> &[Dispatch] {
		&self.passes
	}

	pub fn terminal(&self) -> &Dispatch {
		&self.terminal
	}

	/// Returns the number of partial passes before the terminal pass.
	pub fn depth(&self) -> usize {
		self.passes.len()
	}

	/// Returns the required length of the auxiliary buffer, i.e. the output
	/// length of the first (largest) partial pass. Zero if there are no
	/// partial passes.
	pub fn aux_buffer_len(&self) -> u64 {
		self.passes.first().map_or(0, |pass| pass.results_len)
	}

	/// Returns the buffer that partial pass `pass` reads from. Passing
	/// [`depth`] returns the buffer the terminal pass reads from.
	///
	/// [`depth`]: ReductionPlan::depth
	pub fn input_role(pass: usize) -> BufferRole {
		if pass % 2 == 0 {
			BufferRole::Vals
		} else {
			BufferRole::Aux
		}
	}

	/// Returns the buffer that holds the live values once all partial passes
	/// have executed.
	pub fn terminal_role(&self) -> BufferRole {
		Self::input_role(self.depth())
	}
}

/// Returns `ceil(log_base(num_lanes))`, the most partial passes needed to
/// shrink `num_lanes` down to a single work group of `base` lanes.
fn max_depth(mut num_lanes: u64, base: u64) -> usize {
	let mut depth = 0;
	while num_lanes > 1 {
		num_lanes = (num_lanes - 1) / base + 1;
		depth += 1;
	}
	depth
}
