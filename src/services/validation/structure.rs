//! Checks that need no variable scope. Applied to every template, reachable
//! or not.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::names::{name_problem, validate_field_names};
use super::ValidateOpts;
use crate::domain::models::{
    Arguments, DagTemplate, Template, TemplateBody, TemplateKind, Workflow, WorkflowStep,
};
use crate::domain::ValidationError;
use crate::services::dependency_resolver::DependencyResolver;

const RESOURCE_ACTIONS: [&str; 6] = ["get", "create", "apply", "delete", "replace", "patch"];

fn invalid(message: String) -> ValidationError {
    ValidationError::Invalid(message)
}

pub(super) fn validate_structure(wf: &Workflow, opts: ValidateOpts) -> Result<(), ValidationError> {
    validate_field_names(
        "spec.templates",
        wf.spec.templates.iter().map(|t| t.name.as_str()),
    )?;
    validate_argument_names("spec.arguments", &wf.spec.arguments)?;
    if !opts.lint {
        validate_argument_values("spec.arguments.", &wf.spec.arguments)?;
    }

    if wf.spec.entrypoint.is_empty() {
        return Err(invalid("spec.entrypoint is required".to_string()));
    }
    if wf.template(&wf.spec.entrypoint).is_none() {
        return Err(invalid(format!(
            "spec.entrypoint template '{}' undefined",
            wf.spec.entrypoint
        )));
    }
    if let Some(on_exit) = &wf.spec.on_exit {
        if wf.template(on_exit).is_none() {
            return Err(invalid(format!("spec.onExit template '{on_exit}' undefined")));
        }
    }

    for tmpl in &wf.spec.templates {
        validate_template(wf, tmpl)?;
    }
    Ok(())
}

fn validate_template(wf: &Workflow, tmpl: &Template) -> Result<(), ValidationError> {
    let prefix = format!("templates.{}", tmpl.name);

    validate_field_names(
        &format!("{prefix}.inputs.parameters"),
        tmpl.inputs.parameters.iter().map(|p| p.name.as_str()),
    )?;
    validate_field_names(
        &format!("{prefix}.inputs.artifacts"),
        tmpl.inputs.artifacts.iter().map(|a| a.name.as_str()),
    )?;
    validate_field_names(
        &format!("{prefix}.outputs.parameters"),
        tmpl.outputs.parameters.iter().map(|p| p.name.as_str()),
    )?;
    validate_field_names(
        &format!("{prefix}.outputs.artifacts"),
        tmpl.outputs.artifacts.iter().map(|a| a.name.as_str()),
    )?;

    let body = tmpl.body().map_err(|err| invalid(format!("{prefix} {err}")))?;
    let kind = body.kind();

    if kind.is_leaf() {
        validate_leaf(&prefix, tmpl, body)?;
    } else {
        if tmpl.retry_strategy.is_some() {
            return Err(invalid(format!(
                "{prefix}.retryStrategy is only valid for container, script and resource templates"
            )));
        }
        if tmpl.active_deadline_seconds.is_some() {
            return Err(invalid(format!(
                "{prefix}.activeDeadlineSeconds is only valid for leaf templates"
            )));
        }
    }

    for art in &tmpl.inputs.artifacts {
        let art_ref = format!("{prefix}.inputs.artifacts.{}", art.name);
        validate_artifact_path(&art_ref, art.path.as_deref(), kind)?;
        if art.from.is_some() {
            return Err(invalid(format!("{art_ref}.from not valid in inputs")));
        }
    }
    for art in &tmpl.outputs.artifacts {
        let art_ref = format!("{prefix}.outputs.artifacts.{}", art.name);
        validate_artifact_path(&art_ref, art.path.as_deref(), kind)?;
    }
    for param in &tmpl.outputs.parameters {
        let param_ref = format!("{prefix}.outputs.parameters.{}", param.name);
        let Some(value_from) = &param.value_from else {
            return Err(invalid(format!("{param_ref}.valueFrom not specified")));
        };
        let source = value_from
            .source()
            .map_err(|err| invalid(format!("{param_ref} {err}")))?;
        if !source.valid_for(kind) {
            let expected = match kind {
                TemplateKind::Container | TemplateKind::Script => ".path",
                TemplateKind::Resource => " .jqFilter or jsonPath",
                TemplateKind::Steps | TemplateKind::Dag => ".parameter",
            };
            return Err(invalid(format!(
                "{param_ref}{expected} must be specified for {kind} templates"
            )));
        }
    }

    match body {
        TemplateBody::Steps(groups) => validate_steps(wf, &prefix, groups),
        TemplateBody::Dag(dag) => validate_dag(wf, &prefix, dag),
        _ => Ok(()),
    }
}

fn validate_leaf(prefix: &str, tmpl: &Template, body: TemplateBody<'_>) -> Result<(), ValidationError> {
    if tmpl.parallelism.is_some() {
        return Err(invalid(format!(
            "{prefix}.parallelism is only valid for steps and dag templates"
        )));
    }
    if tmpl.active_deadline_seconds.is_some_and(|secs| secs <= 0) {
        return Err(invalid(format!(
            "{prefix}.activeDeadlineSeconds must be a positive integer > 0"
        )));
    }

    if let TemplateBody::Resource(resource) = body {
        if !RESOURCE_ACTIONS.contains(&resource.action.as_str()) {
            return Err(invalid(format!(
                "{prefix}.resource.action must be one of: {}",
                RESOURCE_ACTIONS.join(", ")
            )));
        }
        if serde_yaml::from_str::<serde_yaml::Value>(&resource.manifest).is_err() {
            return Err(invalid(format!("{prefix}.resource.manifest must be a valid yaml")));
        }
    }

    if let Some(container) = tmpl.main_container() {
        if container.image.is_empty() {
            return Err(invalid(format!("{prefix}.container.image may not be empty")));
        }
        // Artifacts are loaded into the same filesystem as the mounts
        let mut mount_paths: HashMap<&str, String> = HashMap::new();
        for (i, mount) in container.volume_mounts.iter().enumerate() {
            if let Some(prev) = mount_paths.get(mount.mount_path.as_str()) {
                return Err(invalid(format!(
                    "{prefix}.container.volumeMounts[{i}].mountPath '{}' already mounted in {prev}",
                    mount.mount_path
                )));
            }
            mount_paths.insert(
                &mount.mount_path,
                format!("container.volumeMounts.{}", mount.name),
            );
        }
        for (i, art) in tmpl.inputs.artifacts.iter().enumerate() {
            let Some(path) = art.path.as_deref() else {
                continue;
            };
            if let Some(prev) = mount_paths.get(path) {
                return Err(invalid(format!(
                    "{prefix}.inputs.artifacts[{i}].path '{path}' already mounted in {prev}"
                )));
            }
            mount_paths.insert(path, format!("inputs.artifacts.{}", art.name));
        }
    }
    Ok(())
}

fn validate_artifact_path(
    art_ref: &str,
    path: Option<&str>,
    kind: TemplateKind,
) -> Result<(), ValidationError> {
    let has_path = path.is_some_and(|p| !p.is_empty());
    if kind.is_leaf() && !has_path {
        return Err(invalid(format!("{art_ref}.path not specified")));
    }
    if !kind.is_leaf() && has_path {
        return Err(invalid(format!(
            "{art_ref}.path only valid in container/script templates"
        )));
    }
    Ok(())
}

fn validate_argument_names(prefix: &str, args: &Arguments) -> Result<(), ValidationError> {
    validate_field_names(
        &format!("{prefix}.parameters"),
        args.parameters.iter().map(|p| p.name.as_str()),
    )?;
    validate_field_names(
        &format!("{prefix}.artifacts"),
        args.artifacts.iter().map(|a| a.name.as_str()),
    )
}

/// Every argument must carry something to bind.
fn validate_argument_values(prefix: &str, args: &Arguments) -> Result<(), ValidationError> {
    if let Some(param) = args.parameters.iter().find(|p| p.value.is_none()) {
        return Err(invalid(format!("{prefix}{}.value is required", param.name)));
    }
    if let Some(art) = args
        .artifacts
        .iter()
        .find(|a| a.from.is_none() && !a.has_location())
    {
        return Err(invalid(format!(
            "{prefix}{}.from or artifact location is required",
            art.name
        )));
    }
    Ok(())
}

/// Checks shared by steps and DAG tasks
fn validate_invocation(
    wf: &Workflow,
    prefix: &str,
    template: &str,
    args: &Arguments,
    with_items: &[Value],
) -> Result<(), ValidationError> {
    if template.is_empty() {
        return Err(invalid(format!("{prefix}.template is required")));
    }
    if wf.template(template).is_none() {
        return Err(invalid(format!("{prefix}.template '{template}' undefined")));
    }
    validate_argument_names(&format!("{prefix}.arguments"), args)?;
    validate_argument_values(&format!("{prefix}.arguments."), args)?;
    for (i, item) in with_items.iter().enumerate() {
        if !matches!(item, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            return Err(invalid(format!(
                "{prefix}.withItems[{i}] expected string, number, or boolean. received: {item}"
            )));
        }
    }
    Ok(())
}

fn validate_steps(
    wf: &Workflow,
    prefix: &str,
    groups: &[Vec<WorkflowStep>],
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for (i, group) in groups.iter().enumerate() {
        for step in group {
            let group_prefix = format!("{prefix}.steps[{i}]");
            if step.name.is_empty() {
                return Err(invalid(format!("{group_prefix}.name is required")));
            }
            if let Some(problem) = name_problem(&step.name) {
                return Err(invalid(format!(
                    "{group_prefix}.name '{}' is invalid: {problem}",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(format!(
                    "{group_prefix}.name '{}' is not unique",
                    step.name
                )));
            }
            validate_invocation(
                wf,
                &format!("{group_prefix}.{}", step.name),
                &step.template,
                &step.arguments,
                &step.with_items,
            )?;
        }
    }
    Ok(())
}

fn validate_dag(wf: &Workflow, prefix: &str, dag: &DagTemplate) -> Result<(), ValidationError> {
    validate_field_names(
        &format!("{prefix}.dag.tasks"),
        dag.tasks.iter().map(|t| t.name.as_str()),
    )?;

    for task in &dag.tasks {
        let task_prefix = format!("{prefix}.dag.tasks.{}", task.name);
        validate_invocation(
            wf,
            &task_prefix,
            &task.template,
            &task.arguments,
            &task.with_items,
        )?;
        let mut deps = HashSet::new();
        for (j, dep) in task.dependencies.iter().enumerate() {
            if !deps.insert(dep.as_str()) {
                return Err(invalid(format!(
                    "{task_prefix}.dependencies[{j}] dependency '{dep}' duplicated"
                )));
            }
        }
    }

    let resolver = DependencyResolver::new();
    resolver
        .validate_dependencies(&dag.tasks)
        .map_err(|err| invalid(format!("{prefix}.dag {err}")))?;
    if let Some(cycle) = resolver.detect_cycle(&dag.tasks) {
        return Err(invalid(format!(
            "{prefix}.dag dependency cycle detected: {}",
            cycle.join("->")
        )));
    }
    Ok(())
}
