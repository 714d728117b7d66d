//! Implementation of the `kubext lint` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Workflow, WorkflowResource};
use crate::services::{validate_workflow, ValidateOpts};

#[derive(Args, Debug)]
pub struct LintArgs {
    /// Workflow files, or directories scanned for `.yaml`, `.yml` and `.json` files
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Also require every spec-level argument to carry a value
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Serialize)]
pub struct LintResult {
    pub file: PathBuf,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LintOutput {
    pub success: bool,
    pub results: Vec<LintResult>,
}

impl CommandOutput for LintOutput {
    fn to_human(&self) -> String {
        self.results
            .iter()
            .map(|r| match &r.error {
                None => format!("{}: ok", r.file.display()),
                Some(err) => format!("{}: {err}", r.file.display()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub async fn execute(args: LintArgs, json_mode: bool) -> Result<()> {
    let opts = if args.strict {
        ValidateOpts::default()
    } else {
        ValidateOpts::lint()
    };

    let mut results = Vec::new();
    for path in collect_files(&args.files).await? {
        let error = lint_file(&path, opts).await.err();
        results.push(LintResult {
            file: path,
            valid: error.is_none(),
            error,
        });
    }

    let report = LintOutput {
        success: results.iter().all(|r| r.valid),
        results,
    };
    output(&report, json_mode);

    if !report.success {
        let failed = report.results.iter().filter(|r| !r.valid).count();
        anyhow::bail!("{failed} workflow file(s) failed validation");
    }
    Ok(())
}

/// Parse and validate one file, reporting the first problem found.
pub async fn lint_file(path: &Path, opts: ValidateOpts) -> Result<(), String> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| format!("failed to read: {err}"))?;
    let resource = WorkflowResource::from_yaml(&contents)
        .map_err(|err| format!("failed to parse: {err}"))?;
    let workflow =
        Workflow::try_from(&resource).map_err(|err| format!("failed to parse: {err}"))?;
    validate_workflow(&workflow, opts).map_err(|err| err.to_string())
}

/// Expand directories one level deep into their workflow files, sorted by name.
pub async fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if !tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot access {}", path.display()))?
            .is_dir()
        {
            files.push(path.clone());
            continue;
        }
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(path)
            .await
            .with_context(|| format!("failed to read directory {}", path.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let candidate = entry.path();
            if is_workflow_file(&candidate) {
                found.push(candidate);
            }
        }
        found.sort();
        files.extend(found);
    }
    Ok(files)
}

fn is_workflow_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml" | "json")
        )
}
