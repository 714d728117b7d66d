//! Binding invocation arguments to a template's declared inputs.

use thiserror::Error;

use super::substitution::{substitute, Scope, SubstitutionError};
use crate::domain::models::{Arguments, Template};

#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("inputs.parameters.{0} was not supplied")]
    ParameterNotSupplied(String),

    #[error("inputs.artifacts.{0} was not supplied")]
    ArtifactNotSupplied(String),

    #[error(transparent)]
    Substitution(#[from] SubstitutionError),
}

/// Fill a copy of `tmpl`'s inputs from `args`.
///
/// A parameter takes the argument value, else its default, else a value
/// hard-wired in the template. An artifact keeps a hard-wired location,
/// else takes the argument's. The copy is then substituted leniently with
/// `globals` and the bound input parameters.
pub fn process_args(
    tmpl: &Template,
    args: &Arguments,
    globals: &Scope,
) -> Result<Template, ArgumentError> {
    let mut tmpl = tmpl.clone();

    for param in &mut tmpl.inputs.parameters {
        let supplied = args
            .parameter(&param.name)
            .and_then(|arg| arg.value.clone())
            .or_else(|| param.default.clone())
            .or_else(|| param.value.clone());
        match supplied {
            Some(value) => param.value = Some(value),
            None => return Err(ArgumentError::ParameterNotSupplied(param.name.clone())),
        }
    }

    for art in &mut tmpl.inputs.artifacts {
        if art.has_location() {
            continue;
        }
        let Some(arg) = args.artifact(&art.name) else {
            return Err(ArgumentError::ArtifactNotSupplied(art.name.clone()));
        };
        art.location = arg.location.clone();
        if art.from.is_none() {
            art.from.clone_from(&arg.from);
        }
    }

    let mut scope = globals.clone();
    for param in &tmpl.inputs.parameters {
        if let Some(value) = &param.value {
            scope.insert(format!("inputs.parameters.{}", param.name), value.clone());
        }
    }
    Ok(substitute(&tmpl, &scope, false)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Parameter;

    const WHALESAY: &str = r"
name: whalesay
inputs:
  parameters:
  - name: message
  - name: greeting
    default: hello
  - name: internal
    value: '{{managed.parameters.global}}'
container:
  image: docker/whalesay
  args: ['{{inputs.parameters.greeting}} {{inputs.parameters.message}} {{pod.name}}']
";

    fn globals() -> Scope {
        Scope::from([("managed.parameters.global".to_string(), "g".to_string())])
    }

    #[test]
    fn test_binds_arguments_defaults_and_values() {
        let tmpl: Template = serde_yaml::from_str(WHALESAY).unwrap();
        let args = Arguments {
            parameters: vec![Parameter::with_value("message", "world")],
            artifacts: vec![],
        };
        let bound = process_args(&tmpl, &args, &globals()).unwrap();
        assert_eq!(bound.inputs.parameters[0].value.as_deref(), Some("world"));
        assert_eq!(bound.inputs.parameters[1].value.as_deref(), Some("hello"));
        assert_eq!(bound.inputs.parameters[2].value.as_deref(), Some("g"));
        assert_eq!(
            bound.container.unwrap().args,
            vec!["hello world {{pod.name}}".to_string()]
        );
    }

    #[test]
    fn test_missing_parameter() {
        let tmpl: Template = serde_yaml::from_str(WHALESAY).unwrap();
        let err = process_args(&tmpl, &Arguments::default(), &globals()).unwrap_err();
        assert_eq!(err.to_string(), "inputs.parameters.message was not supplied");
    }

    #[test]
    fn test_artifact_location_from_argument() {
        let tmpl: Template = serde_yaml::from_str(
            r"
name: consume
inputs:
  artifacts:
  - name: data
    path: /tmp/data
container:
  image: alpine
",
        )
        .unwrap();
        let err = process_args(&tmpl, &Arguments::default(), &Scope::new()).unwrap_err();
        assert_eq!(err.to_string(), "inputs.artifacts.data was not supplied");

        let args: Arguments = serde_yaml::from_str(
            r"
artifacts:
- name: data
  http:
    url: https://example.com/data
",
        )
        .unwrap();
        let bound = process_args(&tmpl, &args, &Scope::new()).unwrap();
        let data = &bound.inputs.artifacts[0];
        assert_eq!(data.path.as_deref(), Some("/tmp/data"));
        assert!(data.has_location());
    }
}
