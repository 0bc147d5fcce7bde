use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mgpu_core::config::default_config_path;
use mgpu_core::{
    enumerate, DeviceBackend, DeviceGroupConfig, DeviceGroupContext, GpuDescriptor, GroupError,
    MgpuConfig, VulkanBackend,
};

#[derive(Parser)]
#[command(name = "mgpu")]
#[command(about = "mgpu - Multi-GPU device group coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the GPUs visible through Vulkan
    Gpus {
        /// Print the inventory as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build a device group, run a few paced frames across it and print statistics
    Probe {
        /// Configuration file path (defaults to /etc/mgpu/mgpu.toml, then ./mgpu.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// Number of frames to run
        #[arg(short, long, default_value_t = 60)]
        frames: u32,

        /// Print the final statistics as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    mgpu_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gpus { json } => {
            let backend = VulkanBackend::new().context("failed to initialize Vulkan")?;
            let gpus = enumerate(&backend)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&gpus)?);
            } else {
                print_inventory(&gpus);
            }
        }

        Commands::Probe {
            config,
            frames,
            json,
        } => {
            let path = config.unwrap_or_else(default_config_path);
            let settings = MgpuConfig::load_or_default(&path);

            let backend: Arc<dyn DeviceBackend> =
                Arc::new(VulkanBackend::new().context("failed to initialize Vulkan")?);
            let inventory = enumerate(backend.as_ref())?;
            if inventory.is_empty() {
                anyhow::bail!("no Vulkan GPUs found");
            }

            let group_config = DeviceGroupConfig::from_settings(&inventory, &settings.group);
            let mut ctx = DeviceGroupContext::create(group_config, backend)?;
            ctx.create_device_group()?;

            let gpu_count = ctx.gpu_count();
            for source in 0..gpu_count {
                for dest in (0..gpu_count).filter(|&d| d != source) {
                    match ctx.enable_peer_access(source, dest) {
                        Ok(()) => {}
                        Err(GroupError::Unsupported(reason)) => warn!("{}", reason),
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            info!(
                "probing {} GPU(s), primary GPU {}, {} frame(s)",
                gpu_count,
                ctx.primary_gpu(),
                frames
            );

            let mask = ctx.all_gpus_mask();
            for _ in 0..frames {
                ctx.frame_begin();
                let gpu = ctx.route_work(0);
                match ctx.submit_work(gpu, &[], 0) {
                    Ok(()) => {}
                    Err(GroupError::Unsupported(reason)) => warn!("{}", reason),
                    Err(e) => return Err(e.into()),
                }
                ctx.wait_for_completion(mask, Duration::from_secs(1))?;
                ctx.frame_end();
            }

            let snapshot = ctx.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("Device group: {} GPU(s), {} frame(s)", gpu_count, snapshot.total_frames);
                for link in ctx.peer_links() {
                    println!("  peer access: GPU {} -> GPU {}", link.source, link.dest);
                }
                println!();
                for gpu in &snapshot.gpus {
                    let name = ctx
                        .gpu_info(gpu.gpu_index as usize)
                        .map(|g| g.device_name.as_str())
                        .unwrap_or("?");
                    println!("  GPU {}: {}", gpu.gpu_index, name);
                    println!("    Utilization:  {:.1}%", gpu.utilization * 100.0);
                    println!("    Submissions:  {}", gpu.submissions);
                    println!("    Transferred:  {} bytes", gpu.bytes_transferred);
                    println!();
                }
            }

            ctx.destroy();
        }
    }

    Ok(())
}

fn print_inventory(gpus: &[GpuDescriptor]) {
    if gpus.is_empty() {
        println!("No Vulkan GPUs found.");
        return;
    }
    println!("Discovered GPUs:");
    println!();
    for gpu in gpus {
        println!("  GPU {}: {}", gpu.index, gpu.device_name);
        println!("    Type:        {:?}", gpu.device_type);
        println!("    Vendor:      {:#06x}", gpu.vendor_id);
        println!("    Device:      {:#06x}", gpu.device_id);
        println!("    VRAM:        {} MB", gpu.dedicated_vram / (1024 * 1024));
        println!("    Shared:      {} MB", gpu.shared_vram / (1024 * 1024));
        println!(
            "    Queues:      {} famil{}",
            gpu.queue_families.len(),
            if gpu.queue_families.len() == 1 { "y" } else { "ies" }
        );
        println!();
    }
}
