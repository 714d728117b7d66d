//! Variable resolution over the templates reachable from the entrypoint and
//! the exit handler.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::domain::models::constants::{
    GLOBAL_VAR_WORKFLOW_NAME, GLOBAL_VAR_WORKFLOW_NAMESPACE, GLOBAL_VAR_WORKFLOW_PARAMETERS_PREFIX,
    GLOBAL_VAR_WORKFLOW_STATUS, GLOBAL_VAR_WORKFLOW_UID, LOCAL_VAR_POD_NAME,
};
use crate::domain::models::{Arguments, DagTemplate, Template, TemplateBody, Workflow, WorkflowStep};
use crate::domain::ValidationError;
use crate::services::arguments::process_args;
use crate::services::dependency_resolver::DependencyResolver;
use crate::services::substitution::{tags, Scope};

/// Tag roots the controller owns. Anything else is left for the user's tools.
const VARIABLE_ROOTS: [&str; 7] = ["managed", "inputs", "outputs", "pod", "steps", "tasks", "item"];

const PLACEHOLDER: &str = "placeholder";

type Names = HashSet<String>;

pub(super) struct ResolutionContext<'a> {
    wf: &'a Workflow,
    globals: Names,
    /// (template, exit handler walk) pairs already checked
    visited: HashSet<(String, bool)>,
}

impl<'a> ResolutionContext<'a> {
    pub(super) fn new(wf: &'a Workflow) -> Self {
        let mut globals: Names = [
            GLOBAL_VAR_WORKFLOW_NAME,
            GLOBAL_VAR_WORKFLOW_NAMESPACE,
            GLOBAL_VAR_WORKFLOW_UID,
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        for param in &wf.spec.arguments.parameters {
            globals.insert(format!("{GLOBAL_VAR_WORKFLOW_PARAMETERS_PREFIX}{}", param.name));
        }
        Self {
            wf,
            globals,
            visited: HashSet::new(),
        }
    }

    pub(super) fn validate(&mut self) -> Result<(), ValidationError> {
        let wf = self.wf;
        if let Some(entry) = wf.template(&wf.spec.entrypoint) {
            self.validate_template(entry, &wf.spec.arguments, false)?;
        }
        if let Some(on_exit) = wf.spec.on_exit.as_deref().and_then(|name| wf.template(name)) {
            self.validate_template(on_exit, &wf.spec.arguments, true)?;
        }
        Ok(())
    }

    fn validate_template(
        &mut self,
        tmpl: &'a Template,
        args: &Arguments,
        on_exit: bool,
    ) -> Result<(), ValidationError> {
        let prefix = format!("templates.{}", tmpl.name);

        let placeholders: Scope = self
            .globals
            .iter()
            .map(|name| (name.clone(), PLACEHOLDER.to_string()))
            .collect();
        process_args(tmpl, args, &placeholders)
            .map_err(|err| ValidationError::invalid(format!("{prefix} {err}")))?;

        if !self.visited.insert((tmpl.name.clone(), on_exit)) {
            return Ok(());
        }

        let mut scope = self.globals.clone();
        if on_exit {
            scope.insert(GLOBAL_VAR_WORKFLOW_STATUS.to_string());
        }
        for param in &tmpl.inputs.parameters {
            scope.insert(format!("inputs.parameters.{}", param.name));
        }
        let is_leaf = tmpl.is_leaf();
        for art in &tmpl.inputs.artifacts {
            scope.insert(format!("inputs.artifacts.{}", art.name));
            if is_leaf {
                scope.insert(format!("inputs.artifacts.{}.path", art.name));
            }
        }

        match tmpl.body() {
            Ok(TemplateBody::Steps(groups)) => self.validate_steps(tmpl, groups, &mut scope, on_exit)?,
            Ok(TemplateBody::Dag(dag)) => self.validate_dag(tmpl, dag, &mut scope, on_exit)?,
            Ok(_) => {
                scope.insert(LOCAL_VAR_POD_NAME.to_string());
                resolve_all(&prefix, tmpl, &scope)?;
            }
            // Reported by the structural checks
            Err(_) => return Ok(()),
        }

        resolve_all(&format!("{prefix}.outputs"), &tmpl.outputs, &scope)
    }

    fn validate_steps(
        &mut self,
        tmpl: &Template,
        groups: &'a [Vec<WorkflowStep>],
        scope: &mut Names,
        on_exit: bool,
    ) -> Result<(), ValidationError> {
        for (i, group) in groups.iter().enumerate() {
            for step in group {
                let mut step_scope = scope.clone();
                if !step.with_items.is_empty() {
                    step_scope.insert("item".to_string());
                }
                let location = format!("templates.{}.steps[{i}].{}", tmpl.name, step.name);
                resolve_all(&location, step, &step_scope)?;
                if let Some(child) = self.wf.template(&step.template) {
                    self.validate_template(child, &step.arguments, on_exit)?;
                }
            }
            for step in group {
                self.add_outputs_to_scope(&step.template, &format!("steps.{}", step.name), scope);
            }
        }
        Ok(())
    }

    fn validate_dag(
        &mut self,
        tmpl: &Template,
        dag: &'a DagTemplate,
        scope: &mut Names,
        on_exit: bool,
    ) -> Result<(), ValidationError> {
        let resolver = DependencyResolver::new();
        for task in &dag.tasks {
            let mut task_scope = scope.clone();
            for ancestor in resolver.ancestry(&task.name, &dag.tasks) {
                if let Some(ancestor_task) = dag.tasks.iter().find(|t| t.name == ancestor) {
                    self.add_outputs_to_scope(
                        &ancestor_task.template,
                        &format!("tasks.{ancestor}"),
                        &mut task_scope,
                    );
                }
            }
            if !task.with_items.is_empty() {
                task_scope.insert("item".to_string());
            }
            let location = format!("templates.{}.dag.tasks.{}", tmpl.name, task.name);
            resolve_all(&location, task, &task_scope)?;
            if let Some(child) = self.wf.template(&task.template) {
                self.validate_template(child, &task.arguments, on_exit)?;
            }
        }
        // The DAG's own outputs may draw on any task
        for task in &dag.tasks {
            self.add_outputs_to_scope(&task.template, &format!("tasks.{}", task.name), scope);
        }
        Ok(())
    }

    fn add_outputs_to_scope(&self, template: &str, prefix: &str, scope: &mut Names) {
        let Some(tmpl) = self.wf.template(template) else {
            return;
        };
        if tmpl.script.is_some() {
            scope.insert(format!("{prefix}.outputs.result"));
        }
        for param in &tmpl.outputs.parameters {
            scope.insert(format!("{prefix}.outputs.parameters.{}", param.name));
        }
        for art in &tmpl.outputs.artifacts {
            scope.insert(format!("{prefix}.outputs.artifacts.{}", art.name));
        }
    }
}

/// Fail on the first controller variable in `value` that is not in `scope`.
fn resolve_all<T: Serialize>(location: &str, value: &T, scope: &Names) -> Result<(), ValidationError> {
    let tree = serde_json::to_value(value)
        .map_err(|err| ValidationError::invalid(format!("{location}: {err}")))?;
    match first_unresolved(&tree, scope) {
        Some(tag) => Err(ValidationError::Unresolved {
            location: location.to_string(),
            tag,
        }),
        None => Ok(()),
    }
}

fn first_unresolved(value: &Value, scope: &Names) -> Option<String> {
    match value {
        Value::String(s) => tags(s)
            .find(|tag| {
                let root = tag.split('.').next().unwrap_or_default();
                VARIABLE_ROOTS.contains(&root) && !scope.contains(*tag)
            })
            .map(str::to_string),
        Value::Array(items) => items.iter().find_map(|item| first_unresolved(item, scope)),
        Value::Object(map) => map.values().find_map(|v| first_unresolved(v, scope)),
        _ => None,
    }
}
