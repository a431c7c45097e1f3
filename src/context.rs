use std::sync::Arc;

mod vk {
	pub(super) use vulkano::buffer::{
		AllocateBufferError, Buffer, BufferCreateInfo, BufferUsage, Subbuffer,
	};
	pub(super) use vulkano::command_buffer::{
		AutoCommandBufferBuilder, CommandBufferUsage, PrimaryAutoCommandBuffer,
		allocator::{StandardCommandBufferAllocator, StandardCommandBufferAllocatorCreateInfo},
	};
	pub(super) use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
	pub(super) use vulkano::device::{
		Device, DeviceCreateInfo, Queue, QueueCreateInfo, QueueFlags, physical::PhysicalDevice,
	};
	pub(super) use vulkano::instance::{Instance, InstanceCreateFlags, InstanceCreateInfo};
	pub(super) use vulkano::library::{LoadingError, VulkanLibrary as Library};
	pub(super) use vulkano::memory::allocator::{
		AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator,
	};
	pub(super) use vulkano::{Validated, ValidationError, VulkanError as Error};
}
use vulkano::{
	command_buffer::PrimaryCommandBufferAbstract as _, device::DeviceOwned as _,
	sync::GpuFuture as _,
};

use crate::{
	ErrorKind,
	parallel_sum::{self, ParallelSum},
	plan::ReduceConfig,
	transfer,
};

/// A logical device with one compute queue and the allocators needed to run
/// parallel sums on it.
pub struct ComputeContext {
	queue: Arc<vk::Queue>,
	memory_allocator: Arc<vk::StandardMemoryAllocator>,
	command_buffer_allocator: Arc<vk::StandardCommandBufferAllocator>,
	descriptor_set_allocator: Arc<vk::StandardDescriptorSetAllocator>,
}

/// The error type that can be returned by [`ComputeContext`]’s methods.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("Failed to load the Vulkan library: {0}")]
	Loading(#[from] vk::LoadingError),
	#[error("Failed to set up Vulkan: {0}")]
	Setup(vk::Validated<vk::Error>),
	#[error("No Vulkan device with a compute queue was found")]
	NoDevice,
	#[error("The device has no compute queue")]
	NoComputeQueue,
	#[error("Failed to allocate a buffer: {0}")]
	Allocate(#[from] vk::Validated<vk::AllocateBufferError>),
	#[error("Failed to submit work: {0}")]
	Submit(#[from] Box<vk::ValidationError>),
	#[error(transparent)]
	Transfer(#[from] transfer::Error),
	#[error(transparent)]
	Reduce(#[from] parallel_sum::Error),
	#[error(transparent)]
	Vulkan(#[from] vk::Error),
}

impl Error {
	/// Classifies the error for reporting.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Loading(_)
			| Self::Setup(_)
			| Self::NoDevice
			| Self::NoComputeQueue
			| Self::Allocate(_) => ErrorKind::Setup,
			Self::Submit(_) | Self::Transfer(_) | Self::Vulkan(_) => ErrorKind::Dispatch,
			Self::Reduce(err) => err.kind(),
		}
	}
}

impl From<vk::Validated<vk::Error>> for Error {
	fn from(err: vk::Validated<vk::Error>) -> Self {
		match err {
			vk::Validated::Error(err) => Self::Vulkan(err),
			vk::Validated::ValidationError(err) => Self::Submit(err),
		}
	}
}

/// Returns every physical device that exposes a compute-capable queue family.
pub fn compute_devices() -> Result<Vec<Arc<vk::PhysicalDevice>>, Error> {
	let library = vk::Library::new()?;
	let instance = vk::Instance::new(
		library,
		vk::InstanceCreateInfo {
			flags: vk::InstanceCreateFlags::ENUMERATE_PORTABILITY,
			..Default::default()
		},
	)
	.map_err(Error::Setup)?;

	let physical_devices: Vec<_> = instance
		.enumerate_physical_devices()
		.map_err(|e| Error::Setup(vk::Validated::Error(e)))?
		.filter(|physical_device| {
			let supported = compute_queue_family_index(physical_device).is_some();
			if !supported {
				log::warn!(
					"Skipping {}: no compute queue",
					physical_device.properties().device_name
				);
			}
			supported
		})
		.collect();

	if physical_devices.is_empty() {
		return Err(Error::NoDevice);
	}
	Ok(physical_devices)
}

fn compute_queue_family_index(physical_device: &vk::PhysicalDevice) -> Option<u32> {
	physical_device
		.queue_family_properties()
		.iter()
		.position(|queue_family_properties| {
			queue_family_properties
				.queue_flags
				.contains(vk::QueueFlags::COMPUTE)
		})
		.map(|index| index as u32)
}

impl ComputeContext {
	/// Creates a logical device with one compute queue on `physical_device`.
	pub fn new(physical_device: Arc<vk::PhysicalDevice>) -> Result<Self, Error> {
		let queue_family_index =
			compute_queue_family_index(&physical_device).ok_or(Error::NoComputeQueue)?;

		let (device, mut queues) = vk::Device::new(
			physical_device,
			vk::DeviceCreateInfo {
				queue_create_infos: vec![vk::QueueCreateInfo {
					queue_family_index,
					..Default::default()
				}],
				..Default::default()
			},
		)
		.map_err(Error::Setup)?;
		let queue = queues.next().ok_or(Error::NoComputeQueue)?;

		let memory_allocator = Arc::new(vk::StandardMemoryAllocator::new_default(device.clone()));
		let command_buffer_allocator = Arc::new(vk::StandardCommandBufferAllocator::new(
			device.clone(),
			vk::StandardCommandBufferAllocatorCreateInfo::default(),
		));
		let descriptor_set_allocator = Arc::new(vk::StandardDescriptorSetAllocator::new(
			device.clone(),
			Default::default(),
		));

		log::info!(
			"Created compute context on {} (queue family {queue_family_index})",
			device.physical_device().properties().device_name
		);

		Ok(Self {
			queue,
			memory_allocator,
			command_buffer_allocator,
			descriptor_set_allocator,
		})
	}

	/// Creates a context on the first compute-capable device.
	pub fn first() -> Result<Self, Error> {
		let physical_device = compute_devices()?
			.into_iter()
			.next()
			.ok_or(Error::NoDevice)?;
		Self::new(physical_device)
	}

	pub fn device(&self) -> &Arc<vk::Device> {
		self.queue.device()
	}

	pub fn device_name(&self) -> &str {
		&self.device().physical_device().properties().device_name
	}

	/// Builds the parallel sum pipelines for this context’s device.
	pub fn parallel_sum(&self, config: ReduceConfig) -> Result<ParallelSum, Error> {
		Ok(ParallelSum::new(
			self.descriptor_set_allocator.clone(),
			self.memory_allocator.clone(),
			config,
		)?)
	}

	fn create_buffer(
		&self,
		len: u64,
		memory_type_filter: vk::MemoryTypeFilter,
	) -> Result<vk::Subbuffer<[f32]>, Error> {
		Ok(vk::Buffer::new_slice(
			self.memory_allocator.clone(),
			vk::BufferCreateInfo {
				usage: vk::BufferUsage::STORAGE_BUFFER,
				..Default::default()
			},
			vk::AllocationCreateInfo {
				memory_type_filter,
				..Default::default()
			},
			len,
		)?)
	}

	/// Allocates a device buffer of `len` values that the host can read and
	/// write.
	pub fn host_buffer(&self, len: u64) -> Result<vk::Subbuffer<[f32]>, Error> {
		self.create_buffer(
			len,
			vk::MemoryTypeFilter::PREFER_DEVICE | vk::MemoryTypeFilter::HOST_RANDOM_ACCESS,
		)
	}

	/// Allocates a device buffer holding a copy of `vals`.
	pub fn upload(&self, vals: &[f32]) -> Result<vk::Subbuffer<[f32]>, Error> {
		let buffer = self.create_buffer(
			vals.len() as u64,
			vk::MemoryTypeFilter::PREFER_DEVICE | vk::MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
		)?;
		transfer::write_to_buffer(&buffer, 0, vals)?;
		Ok(buffer)
	}

	/// Records commands with `record`, submits them to the compute queue and
	/// blocks until the device has finished executing them.
	pub fn submit<R, E>(
		&self,
		record: impl FnOnce(&mut vk::AutoCommandBufferBuilder<vk::PrimaryAutoCommandBuffer>) -> Result<R, E>,
	) -> Result<R, Error>
	where
		Error: From<E>,
	{
		let mut command_buffer_builder = vk::AutoCommandBufferBuilder::primary(
			self.command_buffer_allocator.clone(),
			self.queue.queue_family_index(),
			vk::CommandBufferUsage::OneTimeSubmit,
		)?;

		let result = record(&mut command_buffer_builder)?;

		command_buffer_builder
			.build()?
			.execute(self.queue.clone())?
			.then_signal_fence_and_flush()?
			.wait(None)?;

		Ok(result)
	}

	/// Sums `vals` on the device and reads the result back.
	///
	/// The reduction is planned before anything is allocated or recorded, so
	/// invalid lengths fail without touching the device.
	pub fn sum(&self, parallel_sum: &ParallelSum, vals: &[f32]) -> Result<f32, Error> {
		let plan = parallel_sum.plan(vals.len() as u64)?;

		let vals_buffer = self.upload(vals)?;
		let aux_buffer = match plan.depth() {
			0 => None,
			_ => Some(self.create_buffer(plan.aux_buffer_len(), vk::MemoryTypeFilter::PREFER_DEVICE)?),
		};
		let sum_buffer = self.host_buffer(1)?;

		self.submit(|command_buffer_builder| {
			parallel_sum.record(command_buffer_builder, vals_buffer, aux_buffer, sum_buffer.clone())
		})?;

		let mut sum = [0.0];
		transfer::read_from_buffer(&sum_buffer, 0, &mut sum)?;
		Ok(sum[0])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_kinds() {
		assert_eq!(Error::NoDevice.kind(), ErrorKind::Setup);
		assert_eq!(
			Error::Reduce(parallel_sum::Error::SumEmpty).kind(),
			ErrorKind::Precondition
		);
		assert_eq!(
			Error::Reduce(parallel_sum::Error::Build {
				stage: "partial",
				log: String::new(),
			})
			.kind(),
			ErrorKind::Build
		);
		assert_eq!(
			Error::Vulkan(vk::Error::OutOfDeviceMemory).kind(),
			ErrorKind::Dispatch
		);
	}

	#[test]
	fn build_log_is_verbatim() {
		let err = parallel_sum::Error::Build {
			stage: "terminal",
			log: "line 3: undeclared identifier".into(),
		};
		assert_eq!(
			err.to_string(),
			"Failed to build the terminal stage:\nline 3: undeclared identifier"
		);
	}

	#[test]
	#[ignore = "requires a Vulkan device"]
	fn first_device() {
		let context = ComputeContext::first().unwrap();
		assert!(!context.device_name().is_empty());
	}
}
