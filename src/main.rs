use clap::{Parser, Subcommand};
use fwi_shot_driver::runner::{
    Backend, BatchArgs, DispatchArgs, LaunchOptions, PlanArgs, SchedulerKind, ShotSettings,
    plan, run_batch, run_dispatch,
};
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(version, about)]
struct Args {
    /// Quiet mode - minimal output, only show summary
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum BackendKind {
    Inline,
    Local,
    Slurm,
    Lsf,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Build the shots of an acquisition file and report them
    Plan {
        /// JSON acquisition file
        #[arg(short, long)]
        acquisition: PathBuf,

        /// Keep only receivers within this horizontal distance of the source
        #[arg(long)]
        aperture: Option<f64>,

        /// Export the shot list to <OUTPUT>.json
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Split the acquisition into batches and run them
    Dispatch {
        /// JSON acquisition file
        #[arg(short, long)]
        acquisition: PathBuf,

        /// Keep only receivers within this horizontal distance of the source
        #[arg(long)]
        aperture: Option<f64>,

        /// Engine XML deck
        #[arg(long)]
        xml: PathBuf,

        /// Engine installation directory
        #[arg(long)]
        geosx: PathBuf,

        /// Simulated time per shot, in seconds
        #[arg(long, default_value = "2.0")]
        max_time: f64,

        /// Seismogram samples per receiver
        #[arg(long, default_value = "500")]
        nb_seismo: usize,

        /// Write wavefields every N time steps
        #[arg(long, default_value = "1")]
        output_interval: usize,

        /// Ricker wavelet peak frequency, in Hz
        #[arg(long, default_value = "5.0")]
        source_frequency: f64,

        /// Where batches run
        #[arg(short, long, value_enum, default_value = "local")]
        backend: BackendKind,

        /// Number of batches
        #[arg(short = 'n', long, default_value = "1")]
        batches: usize,

        /// Batches running at the same time
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// MPI ranks per batch
        #[arg(short, long, default_value = "1")]
        cores: usize,

        /// Engine domain partitions along x
        #[arg(short = 'x', long = "x-partition", default_value = "1")]
        x_partition: usize,

        /// Engine domain partitions along y
        #[arg(short = 'y', long = "y-partition", default_value = "1")]
        y_partition: usize,

        /// Extra argument for the engine bridge (repeatable)
        #[arg(long = "engine-arg", allow_hyphen_values = true)]
        engine_args: Vec<String>,

        /// Sum costs and compute the full gradient at the end of each batch
        #[arg(long)]
        aggregate: bool,

        /// Directory for manifest files and job outputs (default: system temp directory)
        #[arg(long)]
        manifest_dir: Option<PathBuf>,

        /// MPI launcher for the local backend
        #[arg(long, default_value = "mpirun")]
        mpirun: String,

        /// Scheduler job name
        #[arg(long, default_value = "fwi")]
        job_name: String,

        /// Nodes per scheduler job
        #[arg(long, default_value = "1")]
        nodes: usize,

        /// Scheduler partition (SLURM) or queue (LSF)
        #[arg(long)]
        queue: Option<String>,

        /// Scheduler walltime
        #[arg(long)]
        walltime: Option<String>,

        /// Raw scheduler directive (repeatable), e.g. "--account=geo"
        #[arg(long = "directive", allow_hyphen_values = true)]
        directives: Vec<String>,
    },

    /// Run one batch of a dispatched job (started by the dispatcher)
    RunBatch {
        #[arg(long)]
        manifest_dir: PathBuf,

        #[arg(long)]
        job_id: String,

        #[arg(long)]
        batch_id: u32,

        /// Identifies this run of the batch; change it to run a batch again
        #[arg(long, default_value = "0")]
        run_id: String,

        /// Engine XML deck
        #[arg(long)]
        xml: PathBuf,

        /// Engine installation directory
        #[arg(long)]
        geosx: PathBuf,

        /// Engine bridge program (default: <GEOSX>/bin/pygeosx_bridge)
        #[arg(long)]
        bridge: Option<PathBuf>,

        #[arg(short = 'x', long = "x-partition", default_value = "1")]
        x_partition: usize,

        #[arg(short = 'y', long = "y-partition", default_value = "1")]
        y_partition: usize,

        /// Rank of this process (default: from the MPI/SLURM environment)
        #[arg(long)]
        rank: Option<usize>,

        /// Number of ranks (default: from the MPI/SLURM environment)
        #[arg(long)]
        size: Option<usize>,

        #[arg(long)]
        aggregate: bool,

        #[arg(long = "engine-arg", allow_hyphen_values = true)]
        engine_args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.quiet);

    match args.command {
        Command::Plan {
            acquisition,
            aperture,
            output,
        } => {
            let result = plan(PlanArgs {
                acquisition,
                aperture,
                output,
            })
            .await?;

            println!("Acquisition Plan");
            println!("================");
            println!("Shots: {}", result.shots);
            println!(
                "Receivers per shot: {} to {}",
                result.min_receivers, result.max_receivers
            );
            if let Some(path) = result.written {
                println!("Shot list: {}", path.display());
            }
        }
        Command::Dispatch {
            acquisition,
            aperture,
            xml,
            geosx,
            max_time,
            nb_seismo,
            output_interval,
            source_frequency,
            backend,
            batches,
            workers,
            cores,
            x_partition,
            y_partition,
            engine_args,
            aggregate,
            manifest_dir,
            mpirun,
            job_name,
            nodes,
            queue,
            walltime,
            directives,
        } => {
            let backend = match backend {
                BackendKind::Inline => Backend::Inline,
                BackendKind::Local => Backend::Local { mpirun },
                BackendKind::Slurm | BackendKind::Lsf => Backend::Scheduler {
                    kind: if backend == BackendKind::Slurm {
                        SchedulerKind::Slurm
                    } else {
                        SchedulerKind::Lsf
                    },
                    job_name,
                    nodes,
                    queue,
                    walltime,
                    extra: directives,
                },
            };

            if !args.quiet {
                println!("FWI Shot Driver");
                println!("===============");
                println!("Acquisition: {}", acquisition.display());
                println!("Deck: {}", xml.display());
                println!("Batches: {} ({} at a time)", batches, workers);
                println!();
            }

            let dispatch_args = DispatchArgs {
                acquisition,
                aperture,
                xml,
                geosx,
                settings: ShotSettings {
                    max_time,
                    nb_seismo,
                    output_wavefield_interval: output_interval,
                    source_frequency,
                },
                launch: LaunchOptions {
                    cores,
                    x_partition,
                    y_partition,
                    engine_args,
                },
                backend,
                batch_count: batches,
                workers,
                aggregate,
                manifest_dir,
                quiet: args.quiet,
            };

            let result = run_dispatch(dispatch_args).await?;

            println!();
            println!("Dispatch Summary");
            println!("================");
            println!("Job ID: {}", result.job_id);
            println!("Batches submitted: {}", result.batches_submitted);
            println!("Batches failed: {}", result.batches_failed);
            println!("Shots done: {}/{}", result.shots_done, result.total_shots);
            if let Some(cost) = result.total_cost {
                println!("Total cost: {:.6e}", cost);
            }
            println!("Duration: {:.2}s", result.duration.as_secs_f64());

            if let Some(dir) = result.manifest_dir {
                println!();
                println!("Job directory: {}/jobs/{}", dir.display(), result.job_id);
                if result.batches_failed > 0 {
                    println!("To inspect errors:");
                    println!("  cat {}/jobs/{}/batches/*.result", dir.display(), result.job_id);
                    println!("  cat {}/jobs/{}/batches/*.log", dir.display(), result.job_id);
                }
            }
        }
        Command::RunBatch {
            manifest_dir,
            job_id,
            batch_id,
            run_id,
            xml,
            geosx,
            bridge,
            x_partition,
            y_partition,
            rank,
            size,
            aggregate,
            engine_args,
        } => {
            run_batch(BatchArgs {
                manifest_dir,
                job_id,
                batch_id,
                run_id,
                xml,
                geosx,
                bridge,
                x_partition,
                y_partition,
                rank,
                size,
                aggregate,
                engine_args,
            })
            .await?;
        }
    }

    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = if quiet {
        EnvFilter::new("fwi_shot_driver=warn")
    } else {
        EnvFilter::new("fwi_shot_driver=info")
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
