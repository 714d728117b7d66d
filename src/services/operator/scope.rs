//! Outputs of completed steps and tasks, as seen by their later siblings.

use std::collections::HashMap;

use crate::domain::models::{Arguments, Artifact, NodeStatus, Outputs, Template};
use crate::services::substitution::{substitute, Scope};

/// Variables bound inside one steps or DAG template
#[derive(Debug, Clone, Default)]
pub(super) struct VarScope {
    params: Scope,
    artifacts: HashMap<String, Artifact>,
}

impl VarScope {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Bind `<prefix>.outputs.*` to the outputs recorded on `node`.
    pub(super) fn add_node_outputs(&mut self, prefix: &str, node: &NodeStatus) {
        let Some(outputs) = &node.outputs else {
            return;
        };
        if let Some(result) = &outputs.result {
            self.params
                .insert(format!("{prefix}.outputs.result"), result.clone());
        }
        for param in &outputs.parameters {
            if let Some(value) = &param.value {
                self.params.insert(
                    format!("{prefix}.outputs.parameters.{}", param.name),
                    value.clone(),
                );
            }
        }
        for art in &outputs.artifacts {
            self.artifacts
                .insert(format!("{prefix}.outputs.artifacts.{}", art.name), art.clone());
        }
    }

    /// Substitute parameters and bind artifact `from` references.
    ///
    /// Parameter tags that do not resolve are left in place. An artifact
    /// reference that does not resolve is an error.
    pub(super) fn resolve_arguments(
        &self,
        args: &Arguments,
        globals: &Scope,
    ) -> Result<Arguments, String> {
        let mut scope = globals.clone();
        scope.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut resolved = substitute(args, &scope, false).map_err(|err| err.to_string())?;
        for art in &mut resolved.artifacts {
            let Some(from) = art.from.take() else {
                continue;
            };
            let source = self.resolve_artifact(&from)?;
            art.location = source.location.clone();
        }
        Ok(resolved)
    }

    fn resolve_parameter(&self, reference: &str) -> Result<String, String> {
        self.params
            .get(strip_braces(reference))
            .cloned()
            .ok_or_else(|| format!("Unable to resolve: {reference}"))
    }

    fn resolve_artifact(&self, reference: &str) -> Result<&Artifact, String> {
        self.artifacts
            .get(strip_braces(reference))
            .ok_or_else(|| format!("Unable to resolve references: {reference}"))
    }

    /// Outputs a steps or DAG template exports, drawn from its children.
    pub(super) fn template_outputs(&self, tmpl: &Template) -> Result<Option<Outputs>, String> {
        if tmpl.outputs.is_empty() {
            return Ok(None);
        }
        let mut outputs = Outputs::default();
        for param in &tmpl.outputs.parameters {
            let Some(reference) = param
                .value_from
                .as_ref()
                .and_then(|vf| vf.parameter.as_deref())
            else {
                continue;
            };
            let mut param = param.clone();
            param.value = Some(self.resolve_parameter(reference)?);
            param.value_from = None;
            outputs.parameters.push(param);
        }
        for art in &tmpl.outputs.artifacts {
            let Some(reference) = art.from.as_deref() else {
                continue;
            };
            let mut resolved = self.resolve_artifact(reference)?.clone();
            resolved.name.clone_from(&art.name);
            outputs.artifacts.push(resolved);
        }
        Ok(Some(outputs))
    }
}

fn strip_braces(reference: &str) -> &str {
    reference
        .trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Parameter;

    fn produced() -> NodeStatus {
        let outputs: Outputs = serde_yaml::from_str(
            r"
result: hi
parameters:
- name: count
  value: 3
artifacts:
- name: tarball
  path: /tmp/out.tgz
  s3:
    endpoint: s3.amazonaws.com
    bucket: b
    key: k
",
        )
        .unwrap();
        NodeStatus {
            outputs: Some(outputs),
            ..NodeStatus::default()
        }
    }

    #[test]
    fn test_resolves_parameters_and_artifacts() {
        let mut scope = VarScope::new();
        scope.add_node_outputs("steps.gen", &produced());
        let args: Arguments = serde_yaml::from_str(
            r"
parameters:
- name: n
  value: '{{steps.gen.outputs.parameters.count}} {{steps.gen.outputs.result}} {{managed.name}}'
artifacts:
- name: data
  from: '{{steps.gen.outputs.artifacts.tarball}}'
",
        )
        .unwrap();
        let globals = Scope::from([("managed.name".to_string(), "wf".to_string())]);
        let resolved = scope.resolve_arguments(&args, &globals).unwrap();
        assert_eq!(resolved.parameters[0].value.as_deref(), Some("3 hi wf"));
        let data = &resolved.artifacts[0];
        assert!(data.from.is_none());
        assert_eq!(data.location.s3.as_ref().unwrap().key, "k");
    }

    #[test]
    fn test_unknown_artifact_reference() {
        let scope = VarScope::new();
        let args = Arguments {
            parameters: vec![],
            artifacts: vec![Artifact {
                name: "data".into(),
                from: Some("{{steps.nope.outputs.artifacts.x}}".into()),
                ..Artifact::default()
            }],
        };
        let err = scope.resolve_arguments(&args, &Scope::new()).unwrap_err();
        assert!(err.contains("steps.nope.outputs.artifacts.x"));
    }

    #[test]
    fn test_template_outputs() {
        let mut scope = VarScope::new();
        scope.add_node_outputs("tasks.gen", &produced());
        let tmpl: Template = serde_yaml::from_str(
            r"
name: group
dag:
  tasks: []
outputs:
  parameters:
  - name: total
    valueFrom:
      parameter: '{{tasks.gen.outputs.parameters.count}}'
  artifacts:
  - name: bundle
    from: '{{tasks.gen.outputs.artifacts.tarball}}'
",
        )
        .unwrap();
        let outputs = scope.template_outputs(&tmpl).unwrap().unwrap();
        assert_eq!(
            outputs.parameters,
            vec![Parameter::with_value("total", "3")]
        );
        assert_eq!(outputs.artifacts[0].name, "bundle");
        assert!(outputs.artifacts[0].has_location());

        let empty: Template = serde_yaml::from_str("name: e\nsteps: []").unwrap();
        assert!(scope.template_outputs(&empty).unwrap().is_none());
    }
}
