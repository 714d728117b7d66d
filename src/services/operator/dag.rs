use std::collections::HashMap;

use tracing::info;

use super::context::Operation;
use super::expand_items;
use super::scope::VarScope;
use crate::domain::models::{DagTask, NodePhase, NodeStatus, NodeType, Template};
use crate::services::dependency_resolver::DependencyResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// A dependency has not succeeded yet
    Waiting,
    Running,
    Succeeded,
    Failed,
    /// A dependency failed; the task never runs
    Blocked,
}

impl Operation {
    /// Run every task whose dependencies succeeded.
    ///
    /// The DAG settles once nothing is running or waiting: failed if any task
    /// failed, succeeded otherwise.
    pub(super) fn execute_dag(
        &mut self,
        node_name: &str,
        tmpl: &Template,
        boundary_id: Option<&str>,
    ) -> Option<NodeStatus> {
        let node = match self.node_by_name(node_name) {
            Some(node) => node.clone(),
            None => self.init_node(
                node_name,
                NodeType::Dag,
                Some(&tmpl.name),
                boundary_id,
                NodePhase::Running,
                None,
            ),
        };
        if node.completed() {
            return Some(node);
        }
        let tasks = tmpl.dag.as_ref().map(|dag| dag.tasks.as_slice()).unwrap_or_default();

        let order = match DependencyResolver::new().topological_sort(tasks) {
            Ok(order) => order,
            Err(err) => {
                return self.mark_node_phase(node_name, NodePhase::Error, Some(err.to_string()))
            }
        };

        let mut states: HashMap<&str, TaskState> = HashMap::with_capacity(tasks.len());
        let mut scope = VarScope::new();
        for task in order {
            let dependency_states: Vec<TaskState> = task
                .dependencies
                .iter()
                .map(|dep| states.get(dep.as_str()).copied().unwrap_or(TaskState::Waiting))
                .collect();
            let state = if dependency_states
                .iter()
                .any(|s| matches!(s, TaskState::Failed | TaskState::Blocked))
            {
                TaskState::Blocked
            } else if dependency_states.iter().all(|s| *s == TaskState::Succeeded) {
                self.execute_dag_task(node_name, &node.id, task, &scope)
            } else {
                TaskState::Waiting
            };

            if state == TaskState::Succeeded {
                let task_node_name = format!("{node_name}.{}", task.name);
                if let Some(task_node) = self.node_by_name(&task_node_name) {
                    scope.add_node_outputs(&format!("tasks.{}", task.name), task_node);
                }
            }
            states.insert(task.name.as_str(), state);
        }

        if states
            .values()
            .any(|s| matches!(s, TaskState::Waiting | TaskState::Running))
        {
            return self.node_by_name(node_name).cloned();
        }
        if let Some(task) = tasks
            .iter()
            .find(|t| states.get(t.name.as_str()) == Some(&TaskState::Failed))
        {
            info!(workflow = %self.key, node = node_name, task = %task.name, "dag task failed");
            return self.mark_node_phase(
                node_name,
                NodePhase::Failed,
                Some(format!("task '{}' failed", task.name)),
            );
        }

        match scope.template_outputs(tmpl) {
            Ok(outputs) => {
                self.set_node_outputs(node_name, outputs);
                self.mark_node_phase(node_name, NodePhase::Succeeded, None)
            }
            Err(message) => self.mark_node_phase(node_name, NodePhase::Error, Some(message)),
        }
    }

    fn execute_dag_task(
        &mut self,
        dag_name: &str,
        dag_id: &str,
        task: &DagTask,
        scope: &VarScope,
    ) -> TaskState {
        let task_node_name = format!("{dag_name}.{}", task.name);
        let expanded = match expand_items(&task.name, &task.with_items, task) {
            Ok(expanded) => expanded,
            Err(message) => {
                self.error_node(&task_node_name, Some(&task.template), Some(dag_id), message);
                self.add_child_node(dag_name, &task_node_name);
                return TaskState::Failed;
            }
        };

        let mut running = false;
        let mut failed = false;
        for (name, expanded_task) in &expanded {
            let child_name = format!("{dag_name}.{name}");
            let child = match scope.resolve_arguments(&expanded_task.arguments, &self.globals) {
                Ok(args) => {
                    self.execute_template(&expanded_task.template, &args, &child_name, Some(dag_id))
                }
                Err(message) => Some(self.error_node(
                    &child_name,
                    Some(&expanded_task.template),
                    Some(dag_id),
                    message,
                )),
            };
            match child {
                Some(child) => {
                    self.add_child_node(dag_name, &child_name);
                    if !child.completed() {
                        running = true;
                    } else if !child.successful() {
                        failed = true;
                    }
                }
                None => running = true,
            }
        }

        if running {
            TaskState::Running
        } else if failed {
            TaskState::Failed
        } else {
            TaskState::Succeeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Workflow;
    use crate::services::operator::context::Intent;

    const DIAMOND: &str = r"
metadata:
  name: diamond
  namespace: default
spec:
  entrypoint: main
  templates:
  - name: main
    outputs:
      parameters:
      - name: final
        valueFrom:
          parameter: '{{tasks.D.outputs.parameters.said}}'
    dag:
      tasks:
      - name: A
        template: echo
        arguments:
          parameters: [{name: message, value: A}]
      - name: B
        dependencies: [A]
        template: echo
        arguments:
          parameters: [{name: message, value: '{{tasks.A.outputs.parameters.said}}'}]
      - name: C
        dependencies: [A]
        template: echo
        arguments:
          parameters: [{name: message, value: C}]
      - name: D
        dependencies: [B, C]
        template: echo
        arguments:
          parameters: [{name: message, value: D}]
  - name: echo
    inputs:
      parameters:
      - name: message
    outputs:
      parameters:
      - name: said
        valueFrom:
          path: /tmp/said
    container:
      image: alpine
      args: ['{{inputs.parameters.message}}']
";

    fn operation() -> Operation {
        let wf: Workflow = serde_yaml::from_str(DIAMOND).unwrap();
        let mut op = Operation::new(wf);
        op.set_global_parameters();
        op
    }

    fn finish(op: &mut Operation, task: &str, phase: NodePhase) {
        let id = op.wf.node_id(&format!("diamond.{task}"));
        let node = op.wf.status.nodes.get_mut(&id).unwrap();
        node.phase = phase;
        node.outputs = Some(
            serde_yaml::from_str(&format!("parameters:\n- name: said\n  value: from-{task}\n"))
                .unwrap(),
        );
    }

    fn created(op: &mut Operation) -> Vec<String> {
        std::mem::take(&mut op.intents)
            .into_iter()
            .filter_map(|intent| match intent {
                Intent::CreatePod { node_name, .. } => Some(node_name),
                Intent::SignalDeadline { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_diamond_runs_in_dependency_order() {
        let mut op = operation();
        assert!(op.execute_graph().is_none());
        assert_eq!(created(&mut op), vec!["diamond.A"]);

        finish(&mut op, "A", NodePhase::Succeeded);
        op.execute_graph();
        assert_eq!(created(&mut op), vec!["diamond.B", "diamond.C"]);

        finish(&mut op, "B", NodePhase::Succeeded);
        op.execute_graph();
        assert!(created(&mut op).is_empty());

        finish(&mut op, "C", NodePhase::Succeeded);
        op.execute_graph();
        assert_eq!(created(&mut op), vec!["diamond.D"]);

        finish(&mut op, "D", NodePhase::Succeeded);
        let completion = op.execute_graph().unwrap();
        assert_eq!(completion.phase, NodePhase::Succeeded);

        let root = op.node_by_name("diamond").unwrap();
        let outputs = root.outputs.as_ref().unwrap();
        assert_eq!(outputs.parameters[0].value.as_deref(), Some("from-D"));
    }

    #[test]
    fn test_upstream_output_reaches_dependent() {
        let mut op = operation();
        op.execute_graph();
        finish(&mut op, "A", NodePhase::Succeeded);
        op.execute_graph();
        let b = std::mem::take(&mut op.intents)
            .into_iter()
            .find_map(|intent| match intent {
                Intent::CreatePod {
                    node_name,
                    template,
                } if node_name == "diamond.B" => Some(template),
                _ => None,
            })
            .unwrap();
        assert_eq!(b.container.unwrap().args, vec!["from-A".to_string()]);
    }

    #[test]
    fn test_failure_blocks_dependents_and_waits_for_siblings() {
        let mut op = operation();
        op.execute_graph();
        finish(&mut op, "A", NodePhase::Succeeded);
        op.execute_graph();
        created(&mut op);

        finish(&mut op, "B", NodePhase::Failed);
        // C is still running
        assert!(op.execute_graph().is_none());

        finish(&mut op, "C", NodePhase::Succeeded);
        let completion = op.execute_graph().unwrap();
        assert_eq!(completion.phase, NodePhase::Failed);
        assert_eq!(completion.message.as_deref(), Some("task 'B' failed"));
        assert!(op.node_by_name("diamond.D").is_none());
        assert!(created(&mut op).is_empty());
    }
}
