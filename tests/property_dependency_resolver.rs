use kubext::domain::models::DagTask;
use kubext::services::DependencyResolver;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::HashMap;

fn task(name: String, dependencies: Vec<String>) -> DagTask {
    DagTask {
        name,
        template: "echo".to_string(),
        dependencies,
        ..DagTask::default()
    }
}

/// Tasks `t0..tn` where each task may depend on any earlier task
fn acyclic_tasks() -> impl Strategy<Value = Vec<DagTask>> {
    (1usize..20).prop_flat_map(|size| {
        prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), size)
            .prop_map(|picks| {
                picks
                    .into_iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        let mut dependencies: Vec<String> = if i == 0 {
                            Vec::new()
                        } else {
                            deps.iter().map(|d| format!("t{}", d.index(i))).collect()
                        };
                        dependencies.sort();
                        dependencies.dedup();
                        task(format!("t{i}"), dependencies)
                    })
                    .collect()
            })
    })
}

proptest! {
    /// Property: Topological sort orders dependencies before dependents
    #[test]
    fn prop_topological_sort_respects_dependencies(tasks in acyclic_tasks()) {
        let resolver = DependencyResolver::new();
        let sorted = resolver
            .topological_sort(&tasks)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(sorted.len(), tasks.len());

        let position: HashMap<&str, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        for t in &sorted {
            for dep in &t.dependencies {
                prop_assert!(position[dep.as_str()] < position[t.name.as_str()],
                    "dependency {} should come before {}", dep, t.name);
            }
        }
    }

    /// Property: Closing a chain into a ring is always reported as a cycle
    #[test]
    fn prop_ring_is_cycle(size in 2usize..15) {
        let resolver = DependencyResolver::new();
        let tasks: Vec<DagTask> = (0..size)
            .map(|i| task(format!("t{i}"), vec![format!("t{}", (i + 1) % size)]))
            .collect();

        let cycle = resolver.detect_cycle(&tasks);
        prop_assert!(cycle.is_some());
        let cycle = cycle.unwrap();
        prop_assert_eq!(cycle.first(), cycle.last());
        prop_assert_eq!(cycle.len(), size + 1);
    }

    /// Property: Ancestry never includes the task itself in an acyclic graph
    #[test]
    fn prop_ancestry_excludes_self(tasks in acyclic_tasks()) {
        let resolver = DependencyResolver::new();
        for t in &tasks {
            let ancestors = resolver.ancestry(&t.name, &tasks);
            prop_assert!(!ancestors.contains(&t.name));
            for dep in &t.dependencies {
                prop_assert!(ancestors.contains(dep));
            }
        }
    }
}
