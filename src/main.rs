use anyhow::{Context, Result};
use clap::Parser;
use cv_analysis_rs::cli::{self, Command};
use cv_analysis_rs::config::{CvConfig, LogFormat};
use cv_analysis_rs::db;
use cv_analysis_rs::services::metrics::{
    analyze_window, AnalysisOptions, BucketWindow, RiskLevel, WindowSamples,
};
use cv_analysis_rs::services::tasks::{
    AnalysisTaskQueue, AnalysisTaskRequest, AnalysisWorker, ClaimFilter, SystemClock, TaskError,
    WorkerConfig,
};
use cv_analysis_rs::services::tasks::files::{DirectoryResultSink, DirectorySampleSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `analyze --input` document: window samples plus optional verdicts from a
/// parallel experimental model.
#[derive(Debug, Deserialize)]
struct AnalyzeInput {
    #[serde(flatten)]
    samples: WindowSamples,
    #[serde(default)]
    experimental_verdicts: BTreeMap<String, BTreeMap<String, RiskLevel>>,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_queue(config: &CvConfig) -> Result<AnalysisTaskQueue> {
    let store = db::open_task_store(&config.database_url).await?;
    Ok(AnalysisTaskQueue::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config.queue_config(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = CvConfig::from_env();
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    if let Some(api_version) = args.api_version {
        config.api_version = api_version;
    }
    init_tracing(config.log_format);

    match args.command {
        Command::Enqueue(enqueue) => {
            let queue = open_queue(&config).await?;
            let mut request = AnalysisTaskRequest::new(
                enqueue.group_key,
                enqueue.minute,
                enqueue.group_name,
                config.api_version.clone(),
            )
            .with_analysis_type(enqueue.analysis_type)
            .with_cluster_level(enqueue.cluster_level)
            .service_guard(enqueue.service_guard);
            if let Some(priority) = enqueue.priority {
                request = request.with_priority(priority);
            }
            if let Some(experiment) = enqueue.experiment {
                request = request.experimental(experiment);
            }
            print_json(&queue.enqueue(request).await?)?;
        }
        Command::Claim(claim) => {
            let queue = open_queue(&config).await?;
            let task = match claim.experiment {
                Some(experiment) => {
                    queue
                        .claim_next_experimental(
                            &config.api_version,
                            &experiment,
                            &claim.analysis_types,
                        )
                        .await?
                }
                None => {
                    let filter = ClaimFilter {
                        service_guard: claim.service_guard,
                        analysis_types: claim.analysis_types,
                        experiment_name: None,
                    };
                    queue
                        .poll_next(
                            &config.api_version,
                            &filter,
                            Duration::from_millis(claim.wait_ms),
                            config.poll_interval(),
                            config.max_poll_backoff(),
                        )
                        .await?
                }
            };
            print_json(&task)?;
        }
        Command::Complete { task_id, status } => {
            let queue = open_queue(&config).await?;
            print_json(&queue.complete(task_id, status).await?)?;
        }
        Command::Fail {
            task_id,
            code,
            message,
        } => {
            let queue = open_queue(&config).await?;
            let outcome = queue
                .notify_failure(task_id, TaskError::new(code, message))
                .await?;
            print_json(&outcome)?;
        }
        Command::Stats => {
            let queue = open_queue(&config).await?;
            print_json(&queue.stats().await?)?;
        }
        Command::Maintain => {
            let queue = open_queue(&config).await?;
            let expired = queue.expire_overdue().await?;
            let failed = queue.sweep_exhausted().await?;
            print_json(&serde_json::json!({ "expired": expired, "retry_exhausted": failed }))?;
        }
        Command::Analyze(analyze) => {
            let catalog = config.load_catalog(analyze.catalog.as_deref())?;
            let contents = tokio::fs::read_to_string(&analyze.input)
                .await
                .with_context(|| format!("failed to read {}", analyze.input.display()))?;
            let input: AnalyzeInput = serde_json::from_str(&contents)
                .with_context(|| format!("failed to parse {}", analyze.input.display()))?;
            let window = BucketWindow::new(
                analyze.bucket_start,
                analyze.bucket_width.unwrap_or(config.bucket_width_minutes),
            );
            let options = AnalysisOptions {
                excluded_hosts: analyze.excluded_hosts.into_iter().collect::<BTreeSet<_>>(),
                host_breakdown: analyze.host_breakdown,
                experimental_verdicts: input.experimental_verdicts,
            };
            print_json(&analyze_window(&catalog, window, &input.samples, &options))?;
        }
        Command::Work(work) => {
            let catalog = Arc::new(config.load_catalog(None)?);
            let queue = Arc::new(open_queue(&config).await?);
            let mut worker_config = WorkerConfig {
                api_version: config.api_version.clone(),
                poll_interval: config.poll_interval(),
                max_backoff: config.max_poll_backoff(),
                max_concurrency: config.max_concurrent_tasks,
                bucket_width_minutes: config.bucket_width_minutes,
                ..WorkerConfig::default()
            };
            worker_config.analysis.host_breakdown = work.host_breakdown;
            if !work.analysis_types.is_empty() {
                worker_config.filter.analysis_types = work.analysis_types;
            }
            let worker = Arc::new(AnalysisWorker::new(
                queue,
                catalog,
                Arc::new(DirectorySampleSource::new(work.samples_dir)),
                Arc::new(DirectoryResultSink::new(work.results_dir)),
                worker_config,
            ));

            if work.once {
                print_json(&worker.run_once().await?)?;
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let handle = worker.start(cancel.clone());
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
            cancel.cancel();
            handle.await.context("analysis worker panicked")?;
        }
    }
    Ok(())
}
