use crate::services::tasks::{AnalysisType, TaskStatus};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cv-analysis-rs",
    version,
    about = "Continuous-verification risk analysis and analysis task queue"
)]
pub struct Args {
    /// Overrides CV_DATABASE_URL.
    #[arg(long, global = true)]
    pub database_url: Option<String>,
    /// Overrides CV_API_VERSION.
    #[arg(long, global = true)]
    pub api_version: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Queue one analysis window.
    Enqueue(EnqueueArgs),
    /// Claim the next task and print it.
    Claim(ClaimArgs),
    /// Mark a running task SUCCESS or FAILED.
    Complete {
        task_id: Uuid,
        #[arg(long, default_value = "success")]
        status: TaskStatus,
    },
    /// Report a worker failure; the task is retried while budget remains.
    Fail {
        task_id: Uuid,
        #[arg(long, default_value = "worker_error")]
        code: String,
        #[arg(long, default_value = "")]
        message: String,
    },
    /// Print per-status task counts.
    Stats,
    /// Expire overdue tasks and fail stranded ones with no retries left.
    Maintain,
    /// Analyze a JSON file of control and test samples and print the report.
    Analyze(AnalyzeArgs),
    /// Drain the queue, reading samples from and writing reports to directories.
    Work(WorkArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct EnqueueArgs {
    #[arg(long)]
    pub group_key: String,
    #[arg(long)]
    pub minute: i64,
    #[arg(long, default_value = "default")]
    pub group_name: String,
    #[arg(long, default_value = "time_series")]
    pub analysis_type: AnalysisType,
    #[arg(long, default_value_t = 0)]
    pub cluster_level: i32,
    #[arg(long)]
    pub priority: Option<i32>,
    #[arg(long, default_value_t = false)]
    pub service_guard: bool,
    /// Queue as an experimental task for this experiment.
    #[arg(long)]
    pub experiment: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ClaimArgs {
    #[arg(long = "analysis-type")]
    pub analysis_types: Vec<AnalysisType>,
    #[arg(long)]
    pub service_guard: Option<bool>,
    /// Claim experimental tasks of this experiment instead of primary ones.
    /// Experimental claims are single-shot and ignore the service guard.
    #[arg(long, conflicts_with_all = ["wait_ms", "service_guard"])]
    pub experiment: Option<String>,
    /// Keep polling up to this long when the queue is empty.
    #[arg(long, default_value_t = 0)]
    pub wait_ms: u64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct AnalyzeArgs {
    #[arg(long)]
    pub input: PathBuf,
    /// JSON list of metric definitions overriding the built-in catalog.
    #[arg(long)]
    pub catalog: Option<PathBuf>,
    #[arg(long)]
    pub bucket_start: i64,
    #[arg(long)]
    pub bucket_width: Option<i64>,
    #[arg(long = "exclude-host")]
    pub excluded_hosts: Vec<String>,
    #[arg(long, default_value_t = false)]
    pub host_breakdown: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct WorkArgs {
    #[arg(long)]
    pub samples_dir: PathBuf,
    #[arg(long)]
    pub results_dir: PathBuf,
    #[arg(long = "analysis-type")]
    pub analysis_types: Vec<AnalysisType>,
    #[arg(long, default_value_t = false)]
    pub host_breakdown: bool,
    /// Process at most one task and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enqueue_with_defaults() {
        let args = Args::parse_from([
            "cv-analysis-rs",
            "enqueue",
            "--group-key",
            "exec-1",
            "--minute",
            "42",
        ]);
        let Command::Enqueue(enqueue) = args.command else {
            panic!("expected enqueue");
        };
        assert_eq!(enqueue.group_key, "exec-1");
        assert_eq!(enqueue.minute, 42);
        assert_eq!(enqueue.analysis_type, AnalysisType::TimeSeries);
        assert!(enqueue.experiment.is_none());
    }

    #[test]
    fn parses_complete_status_and_global_flags() {
        let id = Uuid::new_v4();
        let id_arg = id.to_string();
        let args = Args::parse_from([
            "cv-analysis-rs",
            "complete",
            id_arg.as_str(),
            "--status",
            "failed",
            "--database-url",
            "sqlite://other.db",
        ]);
        assert_eq!(args.database_url.as_deref(), Some("sqlite://other.db"));
        match args.command {
            Command::Complete { task_id, status } => {
                assert_eq!(task_id, id);
                assert_eq!(status, TaskStatus::Failed);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_analysis_type() {
        let result = Args::try_parse_from([
            "cv-analysis-rs",
            "claim",
            "--analysis-type",
            "astrology",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn experimental_claim_rejects_primary_only_flags() {
        for extra in [["--wait-ms", "100"], ["--service-guard", "true"]] {
            let result = Args::try_parse_from(
                ["cv-analysis-rs", "claim", "--experiment", "canary"]
                    .into_iter()
                    .chain(extra),
            );
            assert!(result.is_err(), "accepted --experiment with {extra:?}");
        }

        let args = Args::parse_from(["cv-analysis-rs", "claim", "--experiment", "canary"]);
        let Command::Claim(claim) = args.command else {
            panic!("expected claim");
        };
        assert_eq!(claim.experiment.as_deref(), Some("canary"));
    }
}
