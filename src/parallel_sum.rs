use std::sync::Arc;

mod vk {
	pub(super) use vulkano::buffer::{
		AllocateBufferError, Buffer, BufferCreateInfo, BufferUsage, Subbuffer,
	};
	pub(super) use vulkano::command_buffer::AutoCommandBufferBuilder;
	pub(super) use vulkano::descriptor_set::{
		DescriptorSet, WriteDescriptorSet, allocator::DescriptorSetAllocator,
	};
	pub(super) use vulkano::memory::allocator::{
		AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator,
	};
	pub(super) use vulkano::pipeline::{
		ComputePipeline, PipelineBindPoint, PipelineLayout, PipelineShaderStageCreateInfo,
		compute::ComputePipelineCreateInfo, layout::PipelineDescriptorSetLayoutCreateInfo,
	};
	pub(super) use vulkano::shader::{ShaderModule, SpecializationConstant};
	pub(super) use vulkano::{Validated, ValidationError, VulkanError as Error};
}
use vulkano::{device::DeviceOwned as _, pipeline::Pipeline as _};

use crate::{
	ErrorKind,
	driver::{self, ReduceStages},
	plan::{self, BufferRole, Dispatch, ReduceConfig, ReductionPlan},
};

/// A pair of compute kernels that sums an array of 32-bit floats in multiple
/// passes: partial passes that fold each work group into one lane, then a
/// terminal pass that folds the last work group into a single value.
pub struct ParallelSum {
	descriptor_set_allocator: Arc<dyn vk::DescriptorSetAllocator>,
	buffer_memory_allocator: Arc<vk::StandardMemoryAllocator>,
	partial_pipeline: Arc<vk::ComputePipeline>,
	terminal_pipeline: Arc<vk::ComputePipeline>,
	config: ReduceConfig,
	max_work_group_count: u32,
}

/// The error type that can be returned by [`ParallelSum`]’s methods.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("Failed to build the {stage} stage:\n{log}")]
	Build { stage: &'static str, log: String },
	#[error("Work group size {work_group_size} exceeds the device maximum of {max}")]
	WorkGroupTooLarge { work_group_size: u32, max: u32 },
	#[error("{scratch_size} bytes of scratch memory exceed the device maximum of {max}")]
	ScratchTooLarge { scratch_size: u64, max: u64 },
	#[error("Pass {pass} needs {num_work_groups} work groups, the device maximum is {max}")]
	TooManyWorkGroups {
		pass: usize,
		num_work_groups: u32,
		max: u32,
	},
	#[error("The auxiliary buffer has invalid length")]
	InvalidAuxiliaryLength,
	#[error("The sum buffer is empty")]
	SumEmpty,
	#[error("Failed to allocate the auxiliary buffer: {0}")]
	Allocate(#[from] vk::Validated<vk::AllocateBufferError>),
	#[error("Failed to record a dispatch: {0}")]
	Dispatch(#[from] Box<vk::ValidationError>),
	#[error(transparent)]
	Plan(#[from] plan::Error),
	#[error(transparent)]
	Vulkan(#[from] vk::Error),
}

impl Error {
	fn build(stage: &'static str, log: impl std::fmt::Display) -> Self {
		Self::Build {
			stage,
			log: log.to_string(),
		}
	}

	/// Classifies the error for reporting.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Build { .. } => ErrorKind::Build,
			Self::WorkGroupTooLarge { .. } | Self::ScratchTooLarge { .. } | Self::Allocate(_) => {
				ErrorKind::Setup
			}
			Self::TooManyWorkGroups { .. }
			| Self::InvalidAuxiliaryLength
			| Self::SumEmpty
			| Self::Plan(_) => ErrorKind::Precondition,
			Self::Dispatch(_) | Self::Vulkan(_) => ErrorKind::Dispatch,
		}
	}
}

impl From<vk::Validated<vk::Error>> for Error {
	fn from(err: vk::Validated<vk::Error>) -> Self {
		match err {
			vk::Validated::Error(err) => Self::Vulkan(err),
			vk::Validated::ValidationError(err) => Self::Dispatch(err),
		}
	}
}

impl ParallelSum {
	/// Constructs a new instance of [`ParallelSum`], building the partial and
	/// terminal pipelines for `config`.
	pub fn new(
		descriptor_set_allocator: Arc<dyn vk::DescriptorSetAllocator>,
		buffer_memory_allocator: Arc<vk::StandardMemoryAllocator>,
		config: ReduceConfig,
	) -> Result<Self, Error> {
		config.validate()?;

		let device = descriptor_set_allocator.device();
		let properties = device.physical_device().properties();

		let max_work_group_size = properties.max_compute_work_group_size[0]
			.min(properties.max_compute_work_group_invocations);
		if config.work_group_size > max_work_group_size {
			return Err(Error::WorkGroupTooLarge {
				work_group_size: config.work_group_size,
				max: max_work_group_size,
			});
		}

		let max_work_group_count = properties.max_compute_work_group_count[0];

		let scratch_size = config.scratch_size(config.work_group_size);
		let max_scratch_size = properties.max_compute_shared_memory_size as u64;
		if scratch_size > max_scratch_size {
			return Err(Error::ScratchTooLarge {
				scratch_size,
				max: max_scratch_size,
			});
		}

		mod partial_shader {
			vulkano_shaders::shader! {
				ty: "compute",
				path: "src/shaders/parallel_sum_partial.comp",
				vulkan_version: "1.3",
				spirv_version: "1.3",
			}
		}
		let partial_shader =
			partial_shader::load(device.clone()).map_err(|e| Error::build("partial", e))?;

		mod terminal_shader {
			vulkano_shaders::shader! {
				ty: "compute",
				path: "src/shaders/parallel_sum_terminal.comp",
				vulkan_version: "1.3",
				spirv_version: "1.3",
			}
		}
		let terminal_shader =
			terminal_shader::load(device.clone()).map_err(|e| Error::build("terminal", e))?;

		let partial_pipeline = create_pipeline(&partial_shader, config, "partial")?;
		let terminal_pipeline = create_pipeline(&terminal_shader, config, "terminal")?;

		log::debug!(
			"Built parallel sum pipelines for {} ({} lanes per work group, {} values per lane)",
			properties.device_name,
			config.work_group_size,
			config.lane_width,
		);

		Ok(Self {
			descriptor_set_allocator,
			buffer_memory_allocator,
			partial_pipeline,
			terminal_pipeline,
			config,
			max_work_group_count,
		})
	}

	pub fn config(&self) -> ReduceConfig {
		self.config
	}

	/// Plans the reduction of `vals_len` values and checks it against the
	/// device’s dispatch limits.
	pub fn plan(&self, vals_len: u64) -> Result<ReductionPlan, Error> {
		let plan = ReductionPlan::new(vals_len, self.config)?;
		for (pass, dispatch) in plan.passes().iter().enumerate() {
			if dispatch.num_work_groups > self.max_work_group_count {
				return Err(Error::TooManyWorkGroups {
					pass,
					num_work_groups: dispatch.num_work_groups,
					max: self.max_work_group_count,
				});
			}
		}
		Ok(plan)
	}

	/// Returns the required length of the auxiliary buffer for the given
	/// input values length, to optionally be passed to [`record`] below.
	///
	/// [`record`]: ParallelSum::record
	pub fn aux_buffer_len(&self, vals_len: u64) -> Result<u64, Error> {
		Ok(self.plan(vals_len)?.aux_buffer_len())
	}

	/// Records the partial and terminal kernels onto the given command buffer.
	///
	/// After execution `sum_buffer[0]` holds the sum of the previous contents
	/// of `vals_buffer`; the contents of `vals_buffer` and `aux_buffer` after
	/// execution are undefined. Returns the buffer the terminal pass reads.
	///
	/// The number of values in `vals_buffer` is derived from its length, so it
	/// must be sized exactly. `aux_buffer` is allowed to be larger than
	/// strictly necessary, and is allocated if not given.
	pub fn record<L>(
		&self,
		command_buffer_builder: &mut vk::AutoCommandBufferBuilder<L>,
		vals_buffer: vk::Subbuffer<[f32]>,
		aux_buffer: Option<vk::Subbuffer<[f32]>>,
		sum_buffer: vk::Subbuffer<[f32]>,
	) -> Result<BufferRole, Error> {
		assert_eq!(
			command_buffer_builder.device(),
			self.descriptor_set_allocator.device()
		);

		let plan = self.plan(vals_buffer.len())?;

		if sum_buffer.len() == 0 {
			return Err(Error::SumEmpty);
		}

		let aux_buffer = match aux_buffer {
			Some(aux_buffer) if aux_buffer.len() < plan.aux_buffer_len() => {
				return Err(Error::InvalidAuxiliaryLength);
			}
			Some(aux_buffer) => aux_buffer,
			// Never bound without partial passes.
			None if plan.depth() == 0 => vals_buffer.clone(),
			None => vk::Buffer::new_slice(
				self.buffer_memory_allocator.clone(),
				vk::BufferCreateInfo {
					usage: vk::BufferUsage::STORAGE_BUFFER,
					..Default::default()
				},
				vk::AllocationCreateInfo {
					memory_type_filter: vk::MemoryTypeFilter::PREFER_DEVICE,
					..Default::default()
				},
				plan.aux_buffer_len(),
			)?,
		};

		log::info!(
			"Recording {} partial passes and a terminal pass over {} values",
			plan.depth(),
			plan.vals_len()
		);

		driver::reduce(
			&mut Recorder {
				parallel_sum: self,
				command_buffer_builder,
			},
			&plan,
			&vals_buffer,
			&aux_buffer,
			&sum_buffer,
		)
	}
}

fn create_pipeline(
	shader: &Arc<vk::ShaderModule>,
	config: ReduceConfig,
	stage_name: &'static str,
) -> Result<Arc<vk::ComputePipeline>, Error> {
	let device = shader.device();

	let specialized_shader = shader
		.specialize({
			use foldhash::HashMapExt as _;
			let mut constants = foldhash::HashMap::new();
			constants.insert(0, vk::SpecializationConstant::U32(config.work_group_size));
			constants.insert(1, vk::SpecializationConstant::U32(config.lane_width));
			constants.insert(
				2,
				vk::SpecializationConstant::U32(config.scratch_len(config.work_group_size)),
			);
			constants
		})
		.map_err(|e| Error::build(stage_name, e))?;
	let entry_point = specialized_shader
		.entry_point("main")
		.ok_or_else(|| Error::build(stage_name, "missing `main` entry point"))?;

	let stage = vk::PipelineShaderStageCreateInfo::new(entry_point);
	let layout = vk::PipelineLayout::new(
		device.clone(),
		vk::PipelineDescriptorSetLayoutCreateInfo::from_stages([&stage])
			.into_pipeline_layout_create_info(device.clone())
			.map_err(|e| Error::build(stage_name, e.error))?,
	)
	.map_err(|e| Error::build(stage_name, e))?;

	vk::ComputePipeline::new(
		device.clone(),
		None,
		vk::ComputePipelineCreateInfo::stage_layout(stage, layout),
	)
	.map_err(|e| Error::build(stage_name, e))
}

/// Records stage dispatches onto a command buffer.
struct Recorder<'a, L> {
	parallel_sum: &'a ParallelSum,
	command_buffer_builder: &'a mut vk::AutoCommandBufferBuilder<L>,
}

impl<L> Recorder<'_, L> {
	/// Binds `pipeline` with its buffers and records the dispatch. `num_lanes`
	/// is pushed as a constant if given.
	fn record_dispatch(
		&mut self,
		pipeline: &Arc<vk::ComputePipeline>,
		dispatch: &Dispatch,
		vals_buffer: &vk::Subbuffer<[f32]>,
		results_buffer: &vk::Subbuffer<[f32]>,
		num_lanes: Option<u32>,
	) -> Result<(), Error> {
		let descriptor_set = vk::DescriptorSet::new(
			self.parallel_sum.descriptor_set_allocator.clone(),
			pipeline.layout().set_layouts()[0].clone(),
			[
				vk::WriteDescriptorSet::buffer(0, vals_buffer.clone().slice(..dispatch.vals_len)),
				vk::WriteDescriptorSet::buffer(
					1,
					results_buffer.clone().slice(..dispatch.results_len),
				),
			],
			[],
		)?;

		self.command_buffer_builder
			.bind_pipeline_compute(pipeline.clone())?
			.bind_descriptor_sets(
				vk::PipelineBindPoint::Compute,
				pipeline.layout().clone(),
				0,
				descriptor_set,
			)?;
		if let Some(num_lanes) = num_lanes {
			self.command_buffer_builder
				.push_constants(pipeline.layout().clone(), 0, num_lanes)?;
		}

		log::debug!(
			"Dispatching {} work items in work groups of {} ({} work groups)",
			dispatch.num_lanes,
			dispatch.work_group_size,
			dispatch.num_work_groups,
		);
		unsafe {
			self.command_buffer_builder
				.dispatch([dispatch.num_work_groups, 1, 1])
		}?;

		Ok(())
	}
}

impl<L> ReduceStages for Recorder<'_, L> {
	type Buffer = vk::Subbuffer<[f32]>;
	type Error = Error;

	fn partial_reduce(
		&mut self,
		dispatch: &Dispatch,
		vals: &Self::Buffer,
		partials: &Self::Buffer,
	) -> Result<(), Error> {
		let parallel_sum = self.parallel_sum;
		self.record_dispatch(
			&parallel_sum.partial_pipeline,
			dispatch,
			vals,
			partials,
			None,
		)
	}

	fn terminal_reduce(
		&mut self,
		dispatch: &Dispatch,
		vals: &Self::Buffer,
		sum: &Self::Buffer,
	) -> Result<(), Error> {
		let parallel_sum = self.parallel_sum;
		// At most `work_group_size` lanes remain.
		let num_lanes = dispatch.num_lanes as u32;
		self.record_dispatch(
			&parallel_sum.terminal_pipeline,
			dispatch,
			vals,
			sum,
			Some(num_lanes),
		)
	}
}
