//! Implementation of the `kubext controller` command.
//!
//! Runs the controller against the in-memory cluster, seeded with the
//! controller configuration and any workflow files given on the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::memory::{MemoryCluster, PodSimulator};
use crate::cli::commands::lint::collect_files;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::constants::CONFIG_MAP_KEY;
use crate::domain::models::{Config, ConfigMap, ObjectMeta, WorkflowResource};
use crate::domain::ports::{ListParams, ResourceClient};
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};
use crate::services::WorkflowController;

/// Controller configuration used when `--controller-config` is not given
const DEFAULT_CONTROLLER_CONFIG: &str = "executorImage: kubext/kubextexec:latest\n";

#[derive(Args, Debug)]
pub struct ControllerArgs {
    /// Name of the controller configuration resource
    #[arg(long)]
    pub configmap: Option<String>,

    /// Number of workflow workers
    #[arg(long)]
    pub workflow_workers: Option<usize>,

    /// Number of pod workers
    #[arg(long)]
    pub pod_workers: Option<usize>,

    /// YAML controller configuration stored under the configuration resource
    #[arg(long)]
    pub controller_config: Option<PathBuf>,

    /// Directory (or single file) of workflows to submit at startup
    #[arg(long)]
    pub workflows: Option<PathBuf>,

    /// Advance pods through their phases as a kubelet would
    #[arg(long)]
    pub simulate: bool,

    /// Interval between simulated pod transitions, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub simulate_interval_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub namespace: String,
    pub name: String,
    pub phase: String,
}

#[derive(Debug, Serialize)]
pub struct ControllerOutput {
    pub workflows: Vec<WorkflowSummary>,
}

impl CommandOutput for ControllerOutput {
    fn to_human(&self) -> String {
        if self.workflows.is_empty() {
            return "No workflows".to_string();
        }
        let mut lines = vec![format!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "PHASE")];
        for wf in &self.workflows {
            lines.push(format!("{:<20} {:<40} {}", wf.namespace, wf.name, wf.phase));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: ControllerArgs, config_path: Option<PathBuf>, json_mode: bool) -> Result<()> {
    let mut settings = match config_path {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    apply_overrides(&mut settings, &args);
    ConfigLoader::validate(&settings)?;

    let log_config = LogConfig::try_from(&settings.logging)?;
    let _logger = LoggerImpl::init(&log_config)?;

    let cluster = MemoryCluster::new();
    let submitted = seed_cluster(
        &cluster,
        &settings,
        args.controller_config.as_deref(),
        args.workflows.as_deref(),
    )
    .await?;
    info!(workflows = submitted, "seeded in-memory cluster");

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => warn!(error = %err, "failed to listen for interrupt"),
        }
        signal_token.cancel();
    });

    let simulator = args.simulate.then(|| {
        let sim = PodSimulator::new(
            cluster.pods.clone(),
            Duration::from_millis(args.simulate_interval_ms.max(1)),
        );
        tokio::spawn(sim.run(cancel.clone()))
    });

    let result = WorkflowController::new(cluster.clients(), settings)
        .run(cancel.clone())
        .await;
    cancel.cancel();
    if let Some(task) = simulator {
        let _ = task.await;
    }
    result.context("controller stopped with an error")?;

    output(&summarize(&cluster).await?, json_mode);
    Ok(())
}

fn apply_overrides(settings: &mut Config, args: &ControllerArgs) {
    if let Some(name) = &args.configmap {
        settings.config_map.clone_from(name);
    }
    if let Some(workers) = args.workflow_workers {
        settings.workflow_workers = workers;
    }
    if let Some(workers) = args.pod_workers {
        settings.pod_workers = workers;
    }
}

/// Store the controller configuration and submit every workflow file found.
///
/// Returns the number of workflows submitted.
pub async fn seed_cluster(
    cluster: &MemoryCluster,
    settings: &Config,
    controller_config: Option<&Path>,
    workflows: Option<&Path>,
) -> Result<usize> {
    let raw_config = match controller_config {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read controller config {}", path.display()))?,
        None => DEFAULT_CONTROLLER_CONFIG.to_string(),
    };
    let config_map = ConfigMap {
        metadata: ObjectMeta::named(&settings.namespace, &settings.config_map),
        data: [(CONFIG_MAP_KEY.to_string(), raw_config)].into_iter().collect(),
    };
    cluster
        .config_maps
        .create(&config_map)
        .await
        .context("failed to store controller config")?;

    let Some(dir) = workflows else {
        return Ok(0);
    };
    let mut submitted = 0;
    for path in collect_files(&[dir.to_path_buf()]).await? {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut resource = WorkflowResource::from_yaml(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if resource.metadata.namespace.is_empty() {
            resource.metadata.namespace = "default".to_string();
        }
        let created = cluster
            .workflows
            .create(&resource)
            .await
            .with_context(|| format!("failed to submit {}", path.display()))?;
        info!(workflow = %created.metadata.key(), file = %path.display(), "submitted workflow");
        submitted += 1;
    }
    Ok(submitted)
}

async fn summarize(cluster: &MemoryCluster) -> Result<ControllerOutput> {
    let listed = cluster.workflows.list(&ListParams::default()).await?;
    let mut workflows: Vec<WorkflowSummary> = listed
        .items
        .iter()
        .map(|wf| WorkflowSummary {
            namespace: wf.metadata.namespace.clone(),
            name: wf.metadata.name.clone(),
            phase: wf.phase().unwrap_or("Pending").to_string(),
        })
        .collect();
    workflows.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    Ok(ControllerOutput { workflows })
}
