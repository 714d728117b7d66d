use tracing::info;

use super::context::Operation;
use super::expand_items;
use super::scope::VarScope;
use crate::domain::models::{NodePhase, NodeStatus, NodeType, Template, WorkflowStep};

impl Operation {
    /// Run step groups in order; a group starts once the previous one succeeded.
    pub(super) fn execute_steps(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        boundary_id: Option<&str>,
    ) -> Option<NodeStatus> {
        let node = match self.node_by_name(node_name) {
            Some(node) => node.clone(),
            None => self.init_node(
                node_name,
                NodeType::Steps,
                Some(&tmpl.name),
                boundary_id,
                NodePhase::Running,
                None,
            ),
        };
        if node.completed() {
            return Some(node);
        }
        let groups = tmpl.steps.as_deref().unwrap_or_default();

        let mut scope = VarScope::new();
        for (i, group) in groups.iter().enumerate() {
            let group_name = format!("{node_name}[{i}]");
            if self.node_by_name(&group_name).is_none() {
                self.init_node(
                    &group_name,
                    NodeType::StepGroup,
                    None,
                    Some(&node.id),
                    NodePhase::Running,
                    None,
                );
            }
            // Groups carried over by a retry are linked to the new parent
            self.add_child_node(node_name, &group_name);

            let group_node = self.execute_step_group(group, &group_name, &node.id, &scope)?;
            if !group_node.completed() {
                return self.node_by_name(node_name).cloned();
            }
            if !group_node.successful() {
                info!(workflow = %self.key, node = node_name, group = %group_name, "step group was unsuccessful");
                return self.mark_node_phase(node_name, NodePhase::Failed, group_node.message);
            }

            for step in group {
                let child_name = format!("{group_name}.{}", step.name);
                // Expanded steps have no node under the plain name
                if let Some(child) = self.node_by_name(&child_name) {
                    scope.add_node_outputs(&format!("steps.{}", step.name), child);
                }
            }
        }

        match scope.template_outputs(tmpl) {
            Ok(outputs) => {
                self.set_node_outputs(node_name, outputs);
                self.mark_node_phase(node_name, NodePhase::Succeeded, None)
            }
            Err(message) => self.mark_node_phase(node_name, NodePhase::Error, Some(message)),
        }
    }

    /// Launch every step of a group in parallel and settle the group once
    /// all launched steps are complete.
    fn execute_step_group(
        &mut self,
        group: &[WorkflowStep],
        group_name: &str,
        boundary_id: &str,
        scope: &VarScope,
    ) -> Option<NodeStatus> {
        let group_node = self.node_by_name(group_name)?.clone();
        if group_node.completed() {
            return Some(group_node);
        }

        let mut expanded = Vec::with_capacity(group.len());
        for step in group {
            match expand_items(&step.name, &step.with_items, step) {
                Ok(steps) => expanded.extend(steps),
                Err(message) => {
                    return self.mark_node_phase(group_name, NodePhase::Error, Some(message))
                }
            }
        }

        let mut pending = false;
        let mut failed: Option<String> = None;
        for (name, step) in &expanded {
            let child_name = format!("{group_name}.{name}");
            // After a failure only steps already started keep advancing
            if failed.is_some() && self.node_by_name(&child_name).is_none() {
                continue;
            }
            let args = match scope.resolve_arguments(&step.arguments, &self.globals) {
                Ok(args) => args,
                Err(message) => {
                    self.error_node(&child_name, Some(&step.template), Some(boundary_id), message);
                    self.add_child_node(group_name, &child_name);
                    return self.mark_node_phase(
                        group_name,
                        NodePhase::Error,
                        Some(format!("child '{child_name}' errored")),
                    );
                }
            };
            match self.execute_template(&step.template, &args, &child_name, Some(boundary_id)) {
                Some(child) => {
                    self.add_child_node(group_name, &child_name);
                    if !child.completed() {
                        pending = true;
                    } else if !child.successful() && failed.is_none() {
                        failed = Some(child.id);
                    }
                }
                None => pending = true,
            }
        }

        let group_node = self.node_by_name(group_name)?;
        let all_done = group_node.children.iter().all(|id| {
            self.wf
                .status
                .nodes
                .get(id)
                .is_some_and(NodeStatus::completed)
        });
        if (pending && failed.is_none()) || !all_done {
            return Some(group_node.clone());
        }

        let failed = failed.or_else(|| {
            group_node
                .children
                .iter()
                .find(|id| {
                    self.wf
                        .status
                        .nodes
                        .get(*id)
                        .is_some_and(|child| !child.successful())
                })
                .cloned()
        });
        match failed {
            Some(id) => {
                info!(workflow = %self.key, group = group_name, child = %id, "step group failed");
                self.mark_node_phase(
                    group_name,
                    NodePhase::Failed,
                    Some(format!("child '{id}' failed")),
                )
            }
            None => self.mark_node_phase(group_name, NodePhase::Succeeded, None),
        }
    }
}
