use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use hermes_pipeline::{
    Collective, DeviceMesh, Feature, FileRendezvous, GlobalBatch, HostAssignment, PipelineConfig,
    SingleHost, Tokenizer, make_iterators, tokenizer_options,
};

#[derive(Parser)]
#[command(name = "hermes-pipeline")]
#[command(about = "Streaming tokenize, pack and shard input pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training pipeline on this host and report batch statistics
    Inspect {
        /// Path to pipeline config JSON
        #[arg(short, long)]
        config: String,

        /// This host's index (0 to host_count-1)
        #[arg(long, default_value = "0")]
        host_index: usize,

        /// Total number of data-loading hosts
        #[arg(long, default_value = "1")]
        host_count: usize,

        /// Devices attached to each host
        #[arg(long, default_value = "1")]
        devices_per_host: usize,

        /// Stop after this many global batches
        #[arg(short, long)]
        steps: Option<usize>,

        /// Decode the first row of the first batch
        #[arg(long)]
        decode: bool,

        /// Place shards on GPUs (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long)]
        gpu: bool,

        /// Log per-step details
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check a config against a device mesh
    Validate {
        /// Path to pipeline config JSON
        #[arg(short, long)]
        config: String,

        /// Total devices in the mesh
        #[arg(long)]
        device_count: usize,

        /// Total number of data-loading hosts
        #[arg(long, default_value = "1")]
        host_count: usize,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

/// Share of real tokens and mean segments per row of one batch.
fn batch_stats(batch: &GlobalBatch) -> Result<(f64, f64)> {
    let Some(segmentation) = batch.get(Feature::InputsSegmentation) else {
        return Ok((0.0, 0.0));
    };
    let rows = segmentation.local_rows()?;
    let positions: usize = rows.iter().map(Vec::len).sum();
    let tokens = rows.iter().flatten().filter(|&&s| s != 0).count();
    let segments: u32 = rows
        .iter()
        .map(|row| row.iter().copied().max().unwrap_or(0))
        .sum();
    if positions == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((
        tokens as f64 / positions as f64,
        segments as f64 / rows.len() as f64,
    ))
}

fn print_first_row(batch: &GlobalBatch, tokenizer: &Tokenizer) -> Result<()> {
    let (Some(inputs), Some(segmentation)) = (
        batch.inputs(),
        batch.get(Feature::InputsSegmentation),
    ) else {
        return Ok(());
    };
    let (Some(row), Some(segments)) = (
        inputs.local_rows()?.into_iter().next(),
        segmentation.local_rows()?.into_iter().next(),
    ) else {
        return Ok(());
    };

    let count = segments.iter().copied().max().unwrap_or(0);
    println!("Row {} of step {}:", batch.local_rows.start, batch.step);
    for segment in 1..=count {
        let ids: Vec<u32> = row
            .iter()
            .zip(&segments)
            .filter(|&(_, &s)| s == segment)
            .map(|(&id, _)| id)
            .collect();
        println!("  [{}] {}", segment, tokenizer.decode(&ids, false)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Inspect { verbose: true, .. });
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Inspect {
            config: config_path,
            host_index,
            host_count,
            devices_per_host,
            steps,
            decode,
            gpu,
            verbose: _,
        } => {
            let config = PipelineConfig::from_json(&config_path)?;
            let host = HostAssignment::new(host_index, host_count)?;

            let devices = (0..devices_per_host)
                .map(|d| get_device(gpu, d))
                .collect::<Result<Vec<_>>>()?;
            let mesh = DeviceMesh::new(devices_per_host * host_count, host_count, devices)?;
            info!("Device mesh: {} devices over {} hosts", mesh.size(), host_count);

            let timeout = Duration::from_secs(config.rendezvous_timeout_secs);
            let (train_collective, eval_collective): (Arc<dyn Collective>, Arc<dyn Collective>) =
                match &config.rendezvous_dir {
                    Some(dir) => (
                        Arc::new(FileRendezvous::new(dir.join("train"), host, timeout)?),
                        Arc::new(FileRendezvous::new(dir.join("eval"), host, timeout)?),
                    ),
                    None => {
                        if host.is_distributed() {
                            anyhow::bail!("Multiple hosts require rendezvous_dir in the config");
                        }
                        (Arc::new(SingleHost), Arc::new(SingleHost))
                    }
                };

            let tokenizer = Arc::new(Tokenizer::load(
                &config.tokenizer_path,
                tokenizer_options(&config),
            )?);
            info!("Tokenizer vocab size: {}", tokenizer.vocab_size());

            let (mut train, eval) = make_iterators(
                &config,
                &mesh,
                host,
                train_collective,
                eval_collective,
                Arc::clone(&tokenizer),
            )?;
            if let Some(eval) = &eval {
                info!("Eval per-host batch size: {}", eval.per_host_batch_size());
            }

            let pb = match steps {
                Some(n) => ProgressBar::new(n as u64),
                None => ProgressBar::new_spinner(),
            };
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos} batches fill: {msg}")?,
            );

            let mut batches = 0usize;
            let mut fill_sum = 0.0;
            let mut segments_sum = 0.0;
            let mut epoch = train.epoch();
            while steps.is_none_or(|n| batches < n) {
                let Some(batch) = epoch.next() else {
                    break;
                };
                let batch = batch?;
                let (fill, segments) = batch_stats(&batch)?;
                if decode && batches == 0 && host.is_main_process() {
                    pb.suspend(|| print_first_row(&batch, &tokenizer))?;
                }
                tracing::debug!(
                    "Step {}: shape {:?}, fill {:.3}, {:.2} segments/row",
                    batch.step,
                    batch.global_shape,
                    fill,
                    segments
                );
                batches += 1;
                fill_sum += fill;
                segments_sum += segments;
                pb.set_message(format!("{:.3}", fill));
                pb.inc(1);
            }
            pb.finish_with_message("done");

            if batches == 0 {
                info!("No complete global batch was produced");
            } else {
                info!(
                    "{} batches, mean fill {:.3}, mean {:.2} segments per row",
                    batches,
                    fill_sum / batches as f64,
                    segments_sum / batches as f64
                );
            }
        }

        Commands::Validate {
            config: config_path,
            device_count,
            host_count,
        } => {
            let config = PipelineConfig::from_json(&config_path)?;
            let mesh = DeviceMesh::cpu(device_count, host_count)?;
            let per_host = mesh.per_host_batch_size(config.global_batch_size_to_load)?;
            println!("Config OK");
            println!("  Global batch size: {}", config.global_batch_size_to_load);
            println!("  Per-host batch size: {}", per_host);
            println!("  Sequence length: {}", config.max_target_length);
            if config.eval_enabled() {
                let eval_global = config.eval_batch_size(mesh.size());
                let eval_per_host = mesh.per_host_batch_size(eval_global)?;
                println!("  Eval batch size: {} ({} per host)", eval_global, eval_per_host);
            } else {
                println!("  Eval: disabled");
            }
        }
    }

    Ok(())
}
