//! Sums `len` copies of `value` on every compute device and compares the
//! result against the exact answer.
//!
//! ```bash
//! parallel-sum
//! parallel-sum --len 65536 --value 1.5 --work-group-size 64
//! RUST_LOG=debug parallel-sum --backend host
//! ```

use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use vulkano_parallel_sum::{ComputeContext, ReduceConfig, context, host::HostDevice};

#[derive(Parser)]
#[command(name = "parallel-sum")]
#[command(about = "Multi-pass parallel sum on the GPU", long_about = None)]
struct Cli {
	/// Number of values to sum
	#[arg(long, default_value_t = 1024 * 1024)]
	len: usize,

	/// Value repeated `len` times
	#[arg(long, default_value_t = 42.0)]
	value: f32,

	/// Lanes per work group (a power of two)
	#[arg(long, default_value_t = ReduceConfig::default().work_group_size)]
	work_group_size: u32,

	/// Consecutive values folded by each lane
	#[arg(long, default_value_t = ReduceConfig::default().lane_width)]
	lane_width: u32,

	/// Where to run the reduction
	#[arg(long, value_enum, default_value_t = Backend::Vulkan)]
	backend: Backend,

	/// Log every dispatch
	#[arg(short, long)]
	verbose: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
	/// Every Vulkan device with a compute queue
	Vulkan,
	/// The CPU simulation
	Host,
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	env_logger::Builder::from_env(
		env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
	)
	.init();

	let config = ReduceConfig {
		work_group_size: cli.work_group_size,
		lane_width: cli.lane_width,
	};
	let vals = vec![cli.value; cli.len];
	let expected = cli.len as f64 * cli.value as f64;

	let result = match cli.backend {
		Backend::Vulkan => run_vulkan(config, &vals, expected),
		Backend::Host => HostDevice::new()
			.sum(config, &vals)
			.map(|sum| report("host", sum, expected))
			.map_err(|e| e.to_string()),
	};

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(message) => {
			eprintln!("{message}");
			ExitCode::FAILURE
		}
	}
}

fn run_vulkan(config: ReduceConfig, vals: &[f32], expected: f64) -> Result<(), String> {
	let describe = |e: context::Error| format!("{:?} failure: {e}", e.kind());

	for physical_device in context::compute_devices().map_err(describe)? {
		let properties = physical_device.properties();
		println!("{}, {:?}", properties.device_name, properties.device_type);

		let context = ComputeContext::new(physical_device.clone()).map_err(describe)?;
		let parallel_sum = context.parallel_sum(config).map_err(describe)?;
		let sum = context.sum(&parallel_sum, vals).map_err(describe)?;

		report(context.device_name(), sum, expected);
		println!();
	}
	Ok(())
}

fn report(device_name: &str, sum: f32, expected: f64) {
	log::info!("Finished summing on {device_name}");
	println!(
		"Final answer: {}; correct answer: {}",
		group_digits(sum.trunc() as f64),
		group_digits(expected.trunc())
	);
}

/// Formats an integral value with comma-separated thousands.
fn group_digits(value: f64) -> String {
	let digits = format!("{:.0}", value.abs());
	let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
	if value < 0.0 {
		grouped.push('-');
	}
	for (i, digit) in digits.chars().enumerate() {
		if i > 0 && (digits.len() - i) % 3 == 0 {
			grouped.push(',');
		}
		grouped.push(digit);
	}
	grouped
}
