use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::domain::models::DagTask;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("dependency '{dependency}' of task '{task}' not defined")]
    Undefined { task: String, dependency: String },

    #[error("dependency cycle detected: {}", .0.join("->"))]
    Cycle(Vec<String>),
}

/// Dependency analysis over the tasks of one DAG template
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

// Standalone helper for cycle detection (no self needed)
fn detect_cycle_util<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                if let Some(cycle_start) = path.iter().position(|&name| name == neighbor) {
                    path.drain(0..cycle_start);
                    path.push(neighbor);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

impl DependencyResolver {
    pub const fn new() -> Self {
        Self
    }

    /// Check that every dependency names a task of the same DAG
    pub fn validate_dependencies(&self, tasks: &[DagTask]) -> Result<(), DependencyError> {
        let names: HashSet<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        for task in tasks {
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|dep| !names.contains(dep.as_str()))
            {
                return Err(DependencyError::Undefined {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Find a dependency cycle, returned as the path that closes it
    pub fn detect_cycle(&self, tasks: &[DagTask]) -> Option<Vec<String>> {
        let graph: HashMap<&str, Vec<&str>> = tasks
            .iter()
            .map(|t| {
                (
                    t.name.as_str(),
                    t.dependencies.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        // Declaration order keeps the reported cycle stable
        for task in tasks {
            let name = task.name.as_str();
            if !visited.contains(name)
                && detect_cycle_util(name, &graph, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path.into_iter().map(str::to_string).collect());
            }
        }

        None
    }

    /// Tasks in dependency order (dependencies before dependents). Ties keep
    /// declaration order.
    pub fn topological_sort<'a>(
        &self,
        tasks: &'a [DagTask],
    ) -> Result<Vec<&'a DagTask>, DependencyError> {
        self.validate_dependencies(tasks)?;
        if let Some(cycle) = self.detect_cycle(tasks) {
            return Err(DependencyError::Cycle(cycle));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&'a DagTask>> = HashMap::new();
        for task in tasks {
            in_degree.insert(&task.name, task.dependencies.len());
            for dep in &task.dependencies {
                dependents.entry(dep.as_str()).or_default().push(task);
            }
        }

        // Kahn's algorithm
        let mut queue: VecDeque<&DagTask> = tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .collect();
        let mut sorted = Vec::with_capacity(tasks.len());

        while let Some(task) = queue.pop_front() {
            sorted.push(task);
            for &dependent in dependents.get(task.name.as_str()).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.name.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        Ok(sorted)
    }

    /// Every task `task_name` transitively depends on, nearest first
    pub fn ancestry(&self, task_name: &str, tasks: &[DagTask]) -> Vec<String> {
        let by_name: HashMap<&str, &DagTask> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut seen = HashSet::new();
        let mut ancestors = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([task_name]);

        while let Some(name) = queue.pop_front() {
            let Some(task) = by_name.get(name) else {
                continue;
            };
            for dep in &task.dependencies {
                if seen.insert(dep.as_str()) {
                    ancestors.push(dep.clone());
                    queue.push_back(dep);
                }
            }
        }
        ancestors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, deps: &[&str]) -> DagTask {
        DagTask {
            name: name.to_string(),
            template: "echo".to_string(),
            dependencies: deps.iter().map(|d| (*d).to_string()).collect(),
            ..DagTask::default()
        }
    }

    fn diamond() -> Vec<DagTask> {
        vec![
            task("D", &["B", "C"]),
            task("A", &[]),
            task("B", &["A"]),
            task("C", &["A"]),
        ]
    }

    #[test]
    fn test_validate_dependencies_missing() {
        let resolver = DependencyResolver::new();
        let err = resolver
            .validate_dependencies(&[task("A", &["ghost"])])
            .unwrap_err();
        assert!(err.to_string().contains("'ghost'"));
    }

    #[test]
    fn test_detect_cycle_no_cycle() {
        assert!(DependencyResolver::new().detect_cycle(&diamond()).is_none());
    }

    #[test]
    fn test_detect_cycle_with_cycle() {
        let tasks = vec![task("A", &["B"]), task("B", &["A"])];
        let cycle = DependencyResolver::new().detect_cycle(&tasks).unwrap();
        assert_eq!(cycle, vec!["A", "B", "A"]);
    }

    #[test]
    fn test_topological_sort_diamond() {
        let tasks = diamond();
        let sorted: Vec<&str> = DependencyResolver::new()
            .topological_sort(&tasks)
            .unwrap()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(sorted, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_topological_sort_with_cycle() {
        let tasks = vec![task("A", &["B"]), task("B", &["A"])];
        assert!(matches!(
            DependencyResolver::new().topological_sort(&tasks),
            Err(DependencyError::Cycle(_))
        ));
    }

    #[test]
    fn test_ancestry() {
        let mut ancestry = DependencyResolver::new().ancestry("D", &diamond());
        ancestry.sort();
        assert_eq!(ancestry, vec!["A", "B", "C"]);
        assert!(DependencyResolver::new().ancestry("A", &diamond()).is_empty());
    }
}
