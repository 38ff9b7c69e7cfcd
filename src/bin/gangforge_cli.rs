//! GangForge CLI - Bridge interface for the order pipeline
//!
//! Commands: plan, run
//! Outputs JSON to stdout
//! Returns non-zero when the job failed or only partially completed

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use gangforge_core::{
    BatchPlanner, CanvasDimensions, DirectorySink, DirectorySource, GangSheetJob, ImageSource,
    JobRunner, JobStatus,
};

#[derive(Parser)]
#[command(name = "gangforge-cli")]
#[command(about = "GangForge CLI - Gang Sheet Layout Engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory containing the design files referenced by the job
    #[arg(short, long, default_value = "designs")]
    designs_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Preview the sub-batch partition for a job without packing anything
    Plan {
        /// Path to the job JSON (GangSheetJob)
        #[arg(short, long)]
        job: PathBuf,
    },

    /// Execute a job and emit the parts
    Run {
        /// Path to the job JSON (GangSheetJob)
        #[arg(short, long)]
        job: PathBuf,

        /// Directory the part files are written into
        #[arg(short, long, default_value = "out")]
        out_dir: PathBuf,
    },
}

fn load_job(path: &PathBuf) -> Result<GangSheetJob, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read job file: {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("Invalid job JSON: {e}"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let source = DirectorySource::new(&cli.designs_dir);

    match cli.command {
        Commands::Plan { job } => {
            let job = match load_job(&job) {
                Ok(j) => j,
                Err(e) => {
                    eprintln!(r#"{{"error": "{e}"}}"#);
                    return ExitCode::FAILURE;
                }
            };
            let dims = match CanvasDimensions::derive(&job.printer, &job.canvas) {
                Ok(d) => d,
                Err(e) => {
                    println!(r#"{{"error": "{e}"}}"#);
                    return ExitCode::FAILURE;
                }
            };
            let planner = BatchPlanner::new(&job.memory, &job.engine, dims.required_bytes());
            let plan = planner.plan(&job.items, |r| source.dimensions(r));
            println!("{}", serde_json::to_string_pretty(&plan).unwrap());
            ExitCode::SUCCESS
        }

        Commands::Run { job, out_dir } => {
            let job = match load_job(&job) {
                Ok(j) => j,
                Err(e) => {
                    eprintln!(r#"{{"error": "{e}"}}"#);
                    return ExitCode::FAILURE;
                }
            };

            let mut sink = DirectorySink::new(out_dir);
            let mut runner = JobRunner::new(&source, &mut sink);

            match runner.run(&job) {
                Ok(summary) => {
                    println!("{}", serde_json::to_string_pretty(&summary).unwrap());
                    match summary.status {
                        JobStatus::Completed | JobStatus::CompletedWithSkips => ExitCode::SUCCESS,
                        JobStatus::PartiallyFailed => ExitCode::from(2),
                        JobStatus::Failed => ExitCode::from(3),
                    }
                }
                Err(e) => {
                    let output = serde_json::json!({
                        "status": "failed",
                        "error": e.to_string(),
                    });
                    println!("{}", serde_json::to_string(&output).unwrap());
                    ExitCode::FAILURE
                }
            }
        }
    }
}
