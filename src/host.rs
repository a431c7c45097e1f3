//! A CPU simulation of the parallel sum stages.
//!
//! Work groups run one after another. Within a work group every tree step is
//! applied to all participating lanes before the next step starts, which is
//! what the group barrier between steps guarantees on the device. The
//! summation order is the device's, so both backends produce identical sums.

use crate::driver::{self, ReduceStages};
use crate::plan::{self, Dispatch, ReduceConfig, ReductionPlan};

/// A handle to a buffer owned by a [`HostDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostBuffer(usize);

/// The stage a recorded dispatch belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
	Partial,
	Terminal,
}

/// The error type that can be returned by [`HostDevice`]’s methods.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("Buffer of length {len} is too short, {required} values are needed")]
	BufferTooShort { len: u64, required: u64 },
	#[error(transparent)]
	Plan(#[from] plan::Error),
}

/// Host-side stand-in for a compute device: owns buffers and executes stage
/// dispatches immediately.
#[derive(Debug, Default)]
pub struct HostDevice {
	buffers: Vec<Vec<f32>>,
	dispatches: Vec<(Stage, Dispatch)>,
}

impl HostDevice {
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocates a zeroed buffer of `len` values.
	pub fn create_buffer(&mut self, len: u64) -> HostBuffer {
		self.buffers.push(vec![0.0; len as usize]);
		HostBuffer(self.buffers.len() - 1)
	}

	/// Allocates a buffer holding a copy of `data`.
	pub fn upload(&mut self, data: &[f32]) -> HostBuffer {
		self.buffers.push(data.to_vec());
		HostBuffer(self.buffers.len() - 1)
	}

	pub fn read(&self, buffer: HostBuffer) -> &[f32] {
		&self.buffers[buffer.0]
	}

	/// Returns every dispatch executed so far, in order.
	pub fn dispatches(&self) -> &[(Stage, Dispatch)] {
		&self.dispatches
	}

	/// Sums `vals` with the multi-pass reduction described by `config`.
	///
	/// Frees every buffer and dispatch record of earlier runs first, so
	/// previously returned [`HostBuffer`]s are invalidated and
	/// [`dispatches`] only lists this run's dispatches.
	///
	/// [`dispatches`]: HostDevice::dispatches
	pub fn sum(&mut self, config: ReduceConfig, vals: &[f32]) -> Result<f32, Error> {
		self.buffers.clear();
		self.dispatches.clear();

		let plan = ReductionPlan::new(vals.len() as u64, config)?;
		log::info!(
			"Summing {} values on the host in {} partial passes",
			vals.len(),
			plan.depth()
		);

		let vals_buffer = self.upload(vals);
		let aux_buffer = self.create_buffer(plan.aux_buffer_len());
		let sum_buffer = self.create_buffer(1);

		driver::reduce(self, &plan, &vals_buffer, &aux_buffer, &sum_buffer)?;

		Ok(self.read(sum_buffer)[0])
	}

	fn check_lens(
		&self,
		dispatch: &Dispatch,
		vals: HostBuffer,
		results: HostBuffer,
	) -> Result<(), Error> {
		for (buffer, required) in [
			(vals, dispatch.vals_len),
			(results, dispatch.results_len),
		] {
			let len = self.buffers[buffer.0].len() as u64;
			if len < required {
				return Err(Error::BufferTooShort { len, required });
			}
		}
		Ok(())
	}

	fn lane_width(dispatch: &Dispatch) -> usize {
		(dispatch.vals_len / dispatch.num_lanes) as usize
	}
}

impl ReduceStages for HostDevice {
	type Buffer = HostBuffer;
	type Error = Error;

	fn partial_reduce(
		&mut self,
		dispatch: &Dispatch,
		vals: &HostBuffer,
		partials: &HostBuffer,
	) -> Result<(), Error> {
		self.check_lens(dispatch, *vals, *partials)?;
		self.dispatches.push((Stage::Partial, *dispatch));

		let lane_width = Self::lane_width(dispatch);
		let work_group_size = dispatch.work_group_size as usize;
		let chunk_len = work_group_size * lane_width;

		let mut results = Vec::with_capacity(dispatch.results_len as usize);
		for chunk in self.buffers[vals.0][..dispatch.vals_len as usize].chunks_exact(chunk_len) {
			let mut scratch = vec![0.0; (dispatch.scratch_size as usize) / size_of::<f32>()];
			reduce_work_group(chunk, &mut scratch, work_group_size, lane_width);
			results.extend_from_slice(&scratch[..lane_width]);
		}

		self.buffers[partials.0][..results.len()].copy_from_slice(&results);
		Ok(())
	}

	fn terminal_reduce(
		&mut self,
		dispatch: &Dispatch,
		vals: &HostBuffer,
		sum: &HostBuffer,
	) -> Result<(), Error> {
		self.check_lens(dispatch, *vals, *sum)?;
		self.dispatches.push((Stage::Terminal, *dispatch));

		let lane_width = Self::lane_width(dispatch);
		// Lanes past `num_lanes` keep their zeros.
		let mut scratch = vec![0.0; (dispatch.scratch_size as usize) / size_of::<f32>()];
		reduce_work_group(
			&self.buffers[vals.0][..dispatch.vals_len as usize],
			&mut scratch,
			dispatch.work_group_size as usize,
			lane_width,
		);

		let mut total = scratch[0];
		for component in &scratch[1..lane_width] {
			total += component;
		}
		self.buffers[sum.0][0] = total;
		Ok(())
	}
}

/// Reduces one work group's chunk in `scratch`, leaving the component sums of
/// all lanes in `scratch[..lane_width]`.
fn reduce_work_group(chunk: &[f32], scratch: &mut [f32], work_group_size: usize, lane_width: usize) {
	scratch[..chunk.len()].copy_from_slice(chunk);

	let mut stride = work_group_size / 2;
	while stride > 0 {
		for lane in 0..stride {
			for component in 0..lane_width {
				scratch[lane * lane_width + component] +=
					scratch[(lane + stride) * lane_width + component];
			}
		}
		stride /= 2;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plan::BufferRole;

	fn assert_close(actual: f32, expected: f64) {
		let relative = ((actual as f64 - expected) / expected).abs();
		assert!(relative < 1e-5, "{actual} is not close to {expected}");
	}

	#[test]
	fn uniform() {
		let vals = vec![42.0; 1024 * 1024];
		let mut device = HostDevice::new();

		let sum = device.sum(ReduceConfig::default(), &vals).unwrap();

		assert_close(sum, 44_040_192.0);
		let stages: Vec<_> = device.dispatches().iter().map(|(s, _)| *s).collect();
		assert_eq!(
			stages,
			[Stage::Partial, Stage::Partial, Stage::Partial, Stage::Terminal]
		);
	}

	#[test]
	fn varied() {
		let vals: Vec<f32> = (0..1 << 18).map(|i| (i % 97) as f32 * 0.25 - 7.0).collect();
		let expected: f64 = vals.iter().map(|&v| v as f64).sum();
		let mut device = HostDevice::new();

		let sum = device.sum(ReduceConfig::default(), &vals).unwrap();

		assert_close(sum, expected);
	}

	#[test]
	fn terminal_only() {
		let vals: Vec<f32> = (1..=128).map(|i| i as f32).collect();
		let mut device = HostDevice::new();

		let sum = device.sum(ReduceConfig::default(), &vals).unwrap();

		assert_eq!(sum, 8256.0);
		assert_eq!(device.dispatches().len(), 1);
		assert_eq!(device.dispatches()[0].0, Stage::Terminal);
		assert_eq!(device.dispatches()[0].1.work_group_size, 32);
	}

	#[test]
	fn single_lane() {
		let mut device = HostDevice::new();
		let sum = device
			.sum(ReduceConfig::default(), &[1.0, 2.0, 3.0, 4.0])
			.unwrap();
		assert_eq!(sum, 10.0);
	}

	#[test]
	fn partial_terminal_work_group() {
		let mut device = HostDevice::new();
		let sum = device.sum(ReduceConfig::default(), &[1.0; 12]).unwrap();
		assert_eq!(sum, 12.0);
		assert_eq!(device.dispatches().len(), 1);
		assert_eq!(device.dispatches()[0].1.num_lanes, 3);

		let vals: Vec<f32> = (0..384).map(|i| i as f32).collect();
		let sum = device.sum(ReduceConfig::default(), &vals).unwrap();
		assert_eq!(sum, 73536.0);
		let stages: Vec<_> = device.dispatches().iter().map(|(s, _)| *s).collect();
		assert_eq!(stages, [Stage::Partial, Stage::Terminal]);
		assert_eq!(device.dispatches()[1].1.num_lanes, 3);
	}

	#[test]
	fn repeated_sums_reuse_arena() {
		let mut device = HostDevice::new();
		let vals = vec![2.0; 4096];

		for _ in 0..3 {
			assert_eq!(device.sum(ReduceConfig::default(), &vals).unwrap(), 8192.0);
		}

		assert_eq!(device.buffers.len(), 3);
		assert_eq!(device.dispatches().len(), 2);
	}

	#[test]
	fn both_parities() {
		let config = ReduceConfig {
			work_group_size: 4,
			lane_width: 2,
		};
		for (vals_len, depth, role) in [
			(2 * 4 * 2, 1, BufferRole::Aux),
			(2 * 4 * 4 * 2, 2, BufferRole::Vals),
			(2 * 4 * 4 * 4 * 2, 3, BufferRole::Aux),
		] {
			let vals: Vec<f32> = (0..vals_len).map(|i| i as f32).collect();
			let plan = ReductionPlan::new(vals_len, config).unwrap();
			assert_eq!(plan.depth(), depth);

			let mut device = HostDevice::new();
			let vals_buffer = device.upload(&vals);
			let aux_buffer = device.create_buffer(plan.aux_buffer_len());
			let sum_buffer = device.create_buffer(1);

			let terminal_role =
				driver::reduce(&mut device, &plan, &vals_buffer, &aux_buffer, &sum_buffer)
					.unwrap();

			assert_eq!(terminal_role, role);
			let expected = (vals_len * (vals_len - 1) / 2) as f32;
			assert_eq!(device.read(sum_buffer)[0], expected);
		}
	}

	#[test]
	fn partial_stage_is_idempotent() {
		let plan = ReductionPlan::new(4096, ReduceConfig::default()).unwrap();
		let pass = plan.passes()[0];
		let vals: Vec<f32> = (0..4096).map(|i| (i as f32).sin()).collect();

		let mut device = HostDevice::new();
		let vals_buffer = device.upload(&vals);
		let partials_buffer = device.create_buffer(pass.results_len);

		device
			.partial_reduce(&pass, &vals_buffer, &partials_buffer)
			.unwrap();
		let first = device.read(partials_buffer).to_vec();
		device
			.partial_reduce(&pass, &vals_buffer, &partials_buffer)
			.unwrap();

		assert_eq!(device.read(partials_buffer), first);
		assert_eq!(device.read(vals_buffer), vals);
	}

	#[test]
	fn partial_stage_output_mapping() {
		let config = ReduceConfig {
			work_group_size: 2,
			lane_width: 2,
		};
		let plan = ReductionPlan::new(8, config).unwrap();
		let pass = plan.passes()[0];

		let mut device = HostDevice::new();
		let vals_buffer = device.upload(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]);
		let partials_buffer = device.create_buffer(pass.results_len);
		device
			.partial_reduce(&pass, &vals_buffer, &partials_buffer)
			.unwrap();

		// Group 0 owns lanes [1, 2] and [3, 4], group 1 owns [10, 20] and [30, 40].
		assert_eq!(device.read(partials_buffer), [4.0, 6.0, 40.0, 60.0]);
	}

	#[test]
	fn precondition_before_dispatch() {
		let mut device = HostDevice::new();

		let err = device
			.sum(ReduceConfig::default(), &vec![1.0; 4000])
			.unwrap_err();

		assert!(matches!(
			err,
			Error::Plan(plan::Error::IndivisiblePass { pass: 0, .. })
		));
		assert!(device.dispatches().is_empty());
	}

	#[test]
	fn short_buffer() {
		let plan = ReductionPlan::new(256, ReduceConfig::default()).unwrap();
		let mut device = HostDevice::new();
		let vals_buffer = device.create_buffer(256);
		let aux_buffer = device.create_buffer(1);
		let sum_buffer = device.create_buffer(1);

		let err = driver::reduce(&mut device, &plan, &vals_buffer, &aux_buffer, &sum_buffer)
			.unwrap_err();

		assert_eq!(
			err,
			Error::BufferTooShort {
				len: 1,
				required: 8
			}
		);
	}
}
