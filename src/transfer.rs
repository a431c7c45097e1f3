//! Copies between host slices and host-visible device buffers.
//!
//! Both directions go through vulkano’s buffer access guards, which keep the
//! mapped range locked against device use for as long as the host view is
//! alive and release it when the guard is dropped, on every return path.

use std::ops::Range;

mod vk {
	pub(super) use vulkano::buffer::Subbuffer;
	pub(super) use vulkano::sync::HostAccessError;
}

/// The error type that can be returned by the transfer functions.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("Transfer of {len} values at offset {offset} overruns a buffer of {buffer_len} values")]
	OutOfBounds {
		offset: u64,
		len: u64,
		buffer_len: u64,
	},
	#[error("The buffer cannot be accessed from the host: {0}")]
	HostAccess(#[from] vk::HostAccessError),
}

/// Copies `data` into `buffer`, starting at value `offset`.
pub fn write_to_buffer(
	buffer: &vk::Subbuffer<[f32]>,
	offset: u64,
	data: &[f32],
) -> Result<(), Error> {
	let Some(range) = checked_range(buffer.len(), offset, data.len() as u64)? else {
		return Ok(());
	};

	let target = buffer.clone().slice(range);
	let mut guard = target.write()?;
	guard.copy_from_slice(data);

	Ok(())
}

/// Copies values of `buffer`, starting at value `offset`, into `out`.
pub fn read_from_buffer(
	buffer: &vk::Subbuffer<[f32]>,
	offset: u64,
	out: &mut [f32],
) -> Result<(), Error> {
	let Some(range) = checked_range(buffer.len(), offset, out.len() as u64)? else {
		return Ok(());
	};

	let source = buffer.clone().slice(range);
	let guard = source.read()?;
	out.copy_from_slice(&guard);

	Ok(())
}

/// Returns the buffer range covered by a transfer, or `None` for an empty
/// transfer.
fn checked_range(buffer_len: u64, offset: u64, len: u64) -> Result<Option<Range<u64>>, Error> {
	let out_of_bounds = Error::OutOfBounds {
		offset,
		len,
		buffer_len,
	};
	match offset.checked_add(len) {
		Some(end) if end <= buffer_len => Ok((len > 0).then_some(offset..end)),
		_ => Err(out_of_bounds),
	}
}
