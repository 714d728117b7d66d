//! State of one reconciliation pass over a single workflow.
//!
//! Everything here is synchronous. Cluster writes the walk decides on are
//! recorded as [`Intent`]s and applied by the operator once the walk ends.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::domain::models::constants::{
    GLOBAL_VAR_WORKFLOW_NAME, GLOBAL_VAR_WORKFLOW_NAMESPACE, GLOBAL_VAR_WORKFLOW_PARAMETERS_PREFIX,
    GLOBAL_VAR_WORKFLOW_STATUS, GLOBAL_VAR_WORKFLOW_UID, LABEL_KEY_COMPLETED, LABEL_KEY_PHASE,
};
use crate::domain::models::{
    Arguments, NodePhase, NodeStatus, NodeType, Outputs, RetryStrategy, Template, TemplateBody,
    Workflow,
};
use crate::services::arguments::process_args;
use crate::services::substitution::Scope;

/// A cluster write decided during the walk
#[derive(Debug, Clone)]
pub(super) enum Intent {
    CreatePod {
        node_name: String,
        template: Box<Template>,
    },
    /// Tell the sidecar of a pod its deadline has passed
    SignalDeadline { pod_name: String },
}

/// How the main graph and exit handler ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Completion {
    pub phase: NodePhase,
    pub message: Option<String>,
}

enum RetryDecision {
    /// Nothing to launch this pass
    Current(NodeStatus),
    /// Launch or resume the attempt with this node name
    Attempt(String),
}

pub(super) struct Operation {
    pub(super) wf: Workflow,
    pub(super) key: String,
    pub(super) globals: Scope,
    pub(super) updated: bool,
    pub(super) intents: Vec<Intent>,
    /// Pods whose nodes are complete, to be labeled once status is persisted
    pub(super) completed_pods: BTreeSet<String>,
    pub(super) requeue_after: Option<Duration>,
    active_pods: i64,
}

impl Operation {
    pub(super) fn new(wf: Workflow) -> Self {
        let key = wf.key();
        Self {
            wf,
            key,
            globals: Scope::new(),
            updated: false,
            intents: Vec::new(),
            completed_pods: BTreeSet::new(),
            requeue_after: None,
            active_pods: 0,
        }
    }

    pub(super) fn set_global_parameters(&mut self) {
        let meta = &self.wf.metadata;
        self.globals
            .insert(GLOBAL_VAR_WORKFLOW_NAME.to_string(), meta.name.clone());
        self.globals
            .insert(GLOBAL_VAR_WORKFLOW_NAMESPACE.to_string(), meta.namespace.clone());
        self.globals
            .insert(GLOBAL_VAR_WORKFLOW_UID.to_string(), meta.uid.clone());
        for param in &self.wf.spec.arguments.parameters {
            if let Some(value) = &param.value {
                self.globals.insert(
                    format!("{GLOBAL_VAR_WORKFLOW_PARAMETERS_PREFIX}{}", param.name),
                    value.clone(),
                );
            }
        }
    }

    /// Ask the worker to revisit the workflow after `after`, keeping the earliest request.
    pub(super) fn request_requeue(&mut self, after: Duration) {
        self.requeue_after = Some(self.requeue_after.map_or(after, |current| current.min(after)));
    }

    pub(super) fn count_active_pods(&mut self) {
        let active = self
            .wf
            .status
            .nodes
            .values()
            .filter(|node| node.node_type == NodeType::Pod && !node.completed())
            .count();
        self.active_pods = i64::try_from(active).unwrap_or(i64::MAX);
    }

    pub(super) fn mark_workflow_phase(
        &mut self,
        phase: NodePhase,
        completed: bool,
        message: Option<String>,
    ) {
        let status = &mut self.wf.status;
        if status.phase != Some(phase) {
            info!(workflow = %self.key, from = ?status.phase, to = %phase, "updated workflow phase");
            status.phase = Some(phase);
            self.wf
                .metadata
                .labels
                .insert(LABEL_KEY_PHASE.to_string(), phase.to_string());
            self.updated = true;
        }
        let status = &mut self.wf.status;
        if status.started_at.is_none() {
            status.started_at = Some(Utc::now());
            self.updated = true;
        }
        if status.message != message {
            status.message = message;
            self.updated = true;
        }
        if completed {
            if status.finished_at.is_none() {
                status.finished_at = Some(Utc::now());
                self.updated = true;
            }
            if !self.wf.is_labeled_completed() {
                self.wf
                    .metadata
                    .labels
                    .insert(LABEL_KEY_COMPLETED.to_string(), "true".to_string());
                self.updated = true;
            }
        }
    }

    pub(super) fn node_by_name(&self, node_name: &str) -> Option<&NodeStatus> {
        self.wf.node_by_name(node_name)
    }

    pub(super) fn init_node(
        &mut self,
        node_name: &str,
        node_type: NodeType,
        template_name: Option<&str>,
        boundary_id: Option<&str>,
        phase: NodePhase,
        message: Option<String>,
    ) -> NodeStatus {
        let id = self.wf.node_id(node_name);
        let now = Utc::now();
        let node = NodeStatus {
            id: id.clone(),
            name: node_name.to_string(),
            display_name: display_name(node_name).to_string(),
            node_type,
            template_name: template_name.map(str::to_string),
            phase,
            boundary_id: boundary_id.map(str::to_string),
            message,
            started_at: Some(now),
            finished_at: phase.is_completed().then_some(now),
            ..NodeStatus::default()
        };
        info!(workflow = %self.key, node = node_name, node_type = ?node_type, phase = %phase, "initialized node");
        self.wf.status.nodes.insert(id, node.clone());
        self.updated = true;
        node
    }

    /// An errored placeholder for an invocation that could not start.
    pub(super) fn error_node(
        &mut self,
        node_name: &str,
        template_name: Option<&str>,
        boundary_id: Option<&str>,
        message: String,
    ) -> NodeStatus {
        if let Some(node) = self.node_by_name(node_name) {
            return node.clone();
        }
        self.init_node(
            node_name,
            NodeType::Skipped,
            template_name,
            boundary_id,
            NodePhase::Error,
            Some(message),
        )
    }

    pub(super) fn mark_node_phase(
        &mut self,
        node_name: &str,
        phase: NodePhase,
        message: Option<String>,
    ) -> Option<NodeStatus> {
        let id = self.wf.node_id(node_name);
        let node = self.wf.status.nodes.get_mut(&id)?;
        if node.phase != phase {
            info!(workflow = %self.key, node = node_name, from = %node.phase, to = %phase, "updated node phase");
            node.phase = phase;
            self.updated = true;
        }
        if message.is_some() && node.message != message {
            node.message = message;
            self.updated = true;
        }
        if node.completed() && node.finished_at.is_none() {
            node.finished_at = Some(Utc::now());
            self.updated = true;
        }
        Some(node.clone())
    }

    pub(super) fn set_node_outputs(&mut self, node_name: &str, outputs: Option<Outputs>) {
        let id = self.wf.node_id(node_name);
        if let Some(node) = self.wf.status.nodes.get_mut(&id) {
            if node.outputs != outputs {
                node.outputs = outputs;
                self.updated = true;
            }
        }
    }

    pub(super) fn add_child_node(&mut self, parent_name: &str, child_name: &str) {
        let parent_id = self.wf.node_id(parent_name);
        let child_id = self.wf.node_id(child_name);
        if let Some(parent) = self.wf.status.nodes.get_mut(&parent_id) {
            if !parent.children.contains(&child_id) {
                parent.children.push(child_id);
                self.updated = true;
            }
        }
    }

    /// Run the entrypoint, then the exit handler once the entrypoint is done.
    ///
    /// Returns how the workflow ended, or `None` while work remains.
    pub(super) fn execute_graph(&mut self) -> Option<Completion> {
        let entrypoint = self.wf.spec.entrypoint.clone();
        let args = self.wf.spec.arguments.clone();
        let root_name = self.wf.metadata.name.clone();
        let root = self.execute_template(&entrypoint, &args, &root_name, None)?;
        if !root.completed() {
            return None;
        }

        let mut exit_node = None;
        if let Some(on_exit) = self.wf.spec.on_exit.clone() {
            let status = if root.successful() {
                NodePhase::Succeeded
            } else {
                root.phase
            };
            self.globals
                .insert(GLOBAL_VAR_WORKFLOW_STATUS.to_string(), status.to_string());
            let exit_name = self.wf.on_exit_node_name();
            info!(workflow = %self.key, template = %on_exit, "running exit handler");
            let node = self.execute_template(&on_exit, &args, &exit_name, None)?;
            if !node.completed() {
                return None;
            }
            exit_node = Some(node);
        }

        let completion = match exit_node {
            Some(exit) if root.successful() && !exit.successful() => Completion {
                phase: exit.phase,
                message: exit.message,
            },
            _ if root.successful() => Completion {
                phase: NodePhase::Succeeded,
                message: None,
            },
            _ => Completion {
                phase: root.phase,
                message: root.message,
            },
        };
        Some(completion)
    }

    /// Advance the node `node_name` running `template_name`.
    ///
    /// Returns `None` when the node could not be created yet: the workflow
    /// is suspended or a parallelism limit is reached.
    pub(super) fn execute_template(
        &mut self,
        template_name: &str,
        args: &Arguments,
        node_name: &str,
        boundary_id: Option<&str>,
    ) -> Option<NodeStatus> {
        let existing = self.node_by_name(node_name).cloned();
        if let Some(node) = &existing {
            if node.completed() {
                return existing;
            }
        }

        let Some(tmpl) = self.wf.template(template_name).cloned() else {
            return Some(self.error_node(
                node_name,
                None,
                boundary_id,
                format!("template '{template_name}' undefined"),
            ));
        };

        if existing.is_none() {
            if self.wf.is_suspended() {
                debug!(workflow = %self.key, node = node_name, "workflow suspended, not creating node");
                return None;
            }
            if let Err(reason) = self.check_parallelism(&tmpl, boundary_id) {
                debug!(workflow = %self.key, node = node_name, reason, "deferring node");
                return None;
            }
        }

        let processed = match process_args(&tmpl, args, &self.globals) {
            Ok(processed) => processed,
            Err(err) => {
                return Some(self.error_node(
                    node_name,
                    Some(template_name),
                    boundary_id,
                    err.to_string(),
                ))
            }
        };

        let Some(strategy) = processed.retry_strategy.clone() else {
            return self.execute_body(node_name, &processed, boundary_id);
        };

        if existing.is_none() {
            self.init_node(
                node_name,
                NodeType::Retry,
                Some(template_name),
                boundary_id,
                NodePhase::Running,
                None,
            );
        }
        match self.process_node_retries(node_name, &strategy)? {
            RetryDecision::Current(node) => Some(node),
            RetryDecision::Attempt(attempt) => {
                self.execute_body(&attempt, &processed, boundary_id);
                self.node_by_name(node_name).cloned()
            }
        }
    }

    fn execute_body(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        boundary_id: Option<&str>,
    ) -> Option<NodeStatus> {
        match tmpl.body() {
            Ok(TemplateBody::Steps(_)) => self.execute_steps(node_name, tmpl, boundary_id),
            Ok(TemplateBody::Dag(_)) => self.execute_dag(node_name, tmpl, boundary_id),
            Ok(_) => self.execute_leaf(node_name, tmpl, boundary_id),
            Err(err) => Some(self.error_node(
                node_name,
                Some(&tmpl.name),
                boundary_id,
                err.to_string(),
            )),
        }
    }

    fn execute_leaf(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        boundary_id: Option<&str>,
    ) -> Option<NodeStatus> {
        if let Some(node) = self.node_by_name(node_name) {
            return Some(node.clone());
        }
        if self.wf.is_suspended() {
            return None;
        }
        self.init_node(
            node_name,
            NodeType::Pod,
            Some(&tmpl.name),
            boundary_id,
            NodePhase::Pending,
            None,
        );
        if !tmpl.inputs.is_empty() {
            let id = self.wf.node_id(node_name);
            if let Some(node) = self.wf.status.nodes.get_mut(&id) {
                node.inputs = Some(tmpl.inputs.clone());
            }
        }
        self.active_pods += 1;
        self.intents.push(Intent::CreatePod {
            node_name: node_name.to_string(),
            template: Box::new(tmpl.clone()),
        });
        self.node_by_name(node_name).cloned()
    }

    fn process_node_retries(
        &mut self,
        retry_name: &str,
        strategy: &RetryStrategy,
    ) -> Option<RetryDecision> {
        let node = self.node_by_name(retry_name)?.clone();
        let Some(last_id) = node.children.last() else {
            let attempt = format!("{retry_name}(0)");
            self.add_child_node(retry_name, &attempt);
            return Some(RetryDecision::Attempt(attempt));
        };
        let Some(last) = self.wf.status.nodes.get(last_id).cloned() else {
            // Registered on an earlier pass but never created
            let attempt = format!("{retry_name}({})", node.children.len() - 1);
            return Some(RetryDecision::Attempt(attempt));
        };

        if !last.completed() {
            return Some(RetryDecision::Current(node));
        }
        if last.successful() {
            self.set_node_outputs(retry_name, last.outputs.clone());
            return self
                .mark_node_phase(retry_name, NodePhase::Succeeded, None)
                .map(RetryDecision::Current);
        }
        if let Some(limit) = strategy.limit {
            let limit = usize::try_from(limit).unwrap_or(0);
            if node.children.len() > limit {
                info!(workflow = %self.key, node = retry_name, "no more retries left");
                return self
                    .mark_node_phase(
                        retry_name,
                        last.phase,
                        Some("No more retries left".to_string()),
                    )
                    .map(RetryDecision::Current);
            }
        }

        let attempt = format!("{retry_name}({})", node.children.len());
        info!(workflow = %self.key, node = retry_name, attempt = %attempt, "retrying failed attempt");
        self.add_child_node(retry_name, &attempt);
        Some(RetryDecision::Attempt(attempt))
    }

    fn check_parallelism(
        &self,
        tmpl: &Template,
        boundary_id: Option<&str>,
    ) -> Result<(), &'static str> {
        if tmpl.is_leaf()
            && self
                .wf
                .spec
                .parallelism
                .is_some_and(|limit| self.active_pods >= limit)
        {
            return Err("workflow parallelism reached");
        }
        if let Some(boundary_id) = boundary_id {
            let limit = self
                .wf
                .status
                .nodes
                .get(boundary_id)
                .and_then(|boundary| boundary.template_name.as_deref())
                .and_then(|name| self.wf.template(name))
                .and_then(|boundary_tmpl| boundary_tmpl.parallelism);
            if limit.is_some_and(|limit| self.count_active_children(boundary_id) >= limit) {
                return Err("template parallelism reached");
            }
        }
        Ok(())
    }

    fn count_active_children(&self, boundary_id: &str) -> i64 {
        let active = self
            .wf
            .status
            .nodes
            .values()
            .filter(|node| {
                node.boundary_id.as_deref() == Some(boundary_id)
                    && matches!(
                        node.node_type,
                        NodeType::Pod | NodeType::Steps | NodeType::Dag
                    )
                    && !node.completed()
            })
            .count();
        i64::try_from(active).unwrap_or(i64::MAX)
    }
}

/// The last component of a node name: `[0]` for a step group, the step or
/// task name (with any item or attempt suffix) otherwise.
fn display_name(node_name: &str) -> &str {
    let mut depth = 0_u32;
    let mut start = 0;
    for (i, c) in node_name.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => start = i + 1,
            '[' if depth == 0 => start = i,
            _ => {}
        }
    }
    &node_name[start..]
}
