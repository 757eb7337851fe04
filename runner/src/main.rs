mod catalog;
mod config;
mod executors;
mod experiment;
mod pipeline;
mod report;
mod selection;

#[cfg(test)]
mod catalog_test;
#[cfg(test)]
mod report_test;

use clap::Parser;
use config::RunnerConfig;
use executors::{Executor, Executors};
use pipeline::RunOptions;
use report::ResultReporter;
use std::{env, fs::File, io, path::PathBuf, process::exit, sync::Mutex};
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

/// Run the OpenHPCA benchmarks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose mode
    #[arg(short, long)]
    verbose: bool,

    /// Partition to use to submit the jobs (relevant when a job manager such as Slurm is used)
    #[arg(short, long, default_value = "")]
    partition: String,

    /// Device to use
    #[arg(short, long, default_value = "")]
    device: String,

    /// The maximum of active running jobs at any given time (other jobs are queued and executed
    /// upon completion of running jobs)
    #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
    max_running_jobs: i64,

    /// Number of MPI ranks per node
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    ppn: u32,

    /// Number of nodes to use
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    num_nodes: u32,

    /// Run all supported tests, including tests not used to create the final metrics
    #[arg(long)]
    long: bool,

    /// Path to the OpenHPCA configuration
    #[arg(short, long, default_value = "openhpca.yaml")]
    config: PathBuf,
}

impl Cli {
    fn options(&self) -> RunOptions {
        RunOptions {
            partition: self.partition.clone(),
            device: self.device.clone(),
            max_running_jobs: self.max_running_jobs,
            ppn: self.ppn,
            num_nodes: self.num_nodes,
            long_run: self.long,
        }
    }
}

fn log_file_path() -> PathBuf {
    let hostname = nix::unistd::gethostname()
        .map(|hostname| hostname.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned());

    env::temp_dir().join(format!("openhpca-run-{hostname}.log"))
}

/// log to stdout and to a log file, only used in verbose mode
fn init_logging() -> io::Result<PathBuf> {
    let path = log_file_path();
    let file = File::create(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_ansi(false)
        .with_writer(io::stdout.and(Mutex::new(file)))
        .init();

    Ok(path)
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        match init_logging() {
            Ok(path) => tracing::info!("Logging to {}", path.display()),
            Err(error) => println!("WARNING: unable to open the log file: {error}"),
        }
    }

    let config = match RunnerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            println!("Unable to load OpenHPCA configuration: {error}");
            exit(1);
        }
    };

    let mut executor = match Executors::load(&config.executor) {
        Ok(executor) => executor,
        Err(error) => {
            println!("ERROR: unable to load the executor: {error}");
            exit(1);
        }
    };
    let reporter = ResultReporter::new(&config.basedir());

    match pipeline::run(&config, &cli.options(), &mut executor, &reporter) {
        Ok(results) => print!("\nOpenHPCA:\n{results}"),
        Err(error) => {
            println!("ERROR: {error}");
            exit(1);
        }
    }
}
