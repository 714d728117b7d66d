//! Static validation of workflow documents.
//!
//! Validation runs in two passes. The structural pass checks every template
//! for naming, body kind, policy placement, output sources, and argument
//! completeness. The resolution pass walks the template graph from the
//! entrypoint and the exit handler, binding arguments to inputs and checking
//! that every `{{...}}` variable resolves in the scope where it appears.
//! The first violation is returned.

mod names;
mod resolve;
mod structure;

use crate::domain::models::Workflow;
use crate::domain::ValidationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOpts {
    /// Allow spec-level arguments without values, as when linting a
    /// document whose arguments are supplied at submission
    pub lint: bool,
}

impl ValidateOpts {
    pub const fn lint() -> Self {
        Self { lint: true }
    }
}

/// Validate a workflow without side effects.
pub fn validate_workflow(wf: &Workflow, opts: ValidateOpts) -> Result<(), ValidationError> {
    structure::validate_structure(wf, opts)?;
    resolve::ResolutionContext::new(wf).validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Workflow {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn validate(yaml: &str) -> Result<(), ValidationError> {
        validate_workflow(&parse(yaml), ValidateOpts::default())
    }

    fn assert_rejected(yaml: &str, fragment: &str) {
        match validate(yaml) {
            Ok(()) => panic!("expected an error containing {fragment:?}"),
            Err(err) => assert!(
                err.to_string().contains(fragment),
                "{err} does not contain {fragment:?}"
            ),
        }
    }

    const INVALID: &str = "is invalid";

    const DUP_TEMPLATE_NAMES: &str = r"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    const DUP_INPUT_NAMES: &str = r#"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    inputs:
      parameters:
      - name: dup
        value: "value"
      - name: dup
        value: "value"
    container:
      image: docker/whalesay:latest
"#;

    const EMPTY_NAME: &str = r#"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    inputs:
      parameters:
      - name: ""
        value: "value"
    container:
      image: docker/whalesay:latest
"#;

    #[test]
    fn test_duplicate_or_empty_names() {
        assert_rejected(DUP_TEMPLATE_NAMES, "not unique");
        assert_rejected(DUP_INPUT_NAMES, "not unique");
        assert_rejected(EMPTY_NAME, "name is required");
    }

    const UNRESOLVED_INPUT: &str = r"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:{{inputs.parameters.unresolved}}
";

    const UNRESOLVED_OUTPUT: &str = r#"
metadata:
  generateName: hello-world-
spec:
  entrypoint: unresolved-output-steps
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
  - name: unresolved-output-steps
    steps:
    - - name: whalesay
        template: whalesay
    outputs:
      parameters:
      - name: unresolved
        valueFrom:
          parameter: "{{steps.whalesay.outputs.parameters.unresolved}}"
"#;

    #[test]
    fn test_unresolved() {
        assert_rejected(UNRESOLVED_INPUT, "failed to resolve");
        assert_rejected(UNRESOLVED_OUTPUT, "failed to resolve");
    }

    const STEP_OUTPUT_REFERENCES: &str = r#"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    inputs:
      parameters:
      - name: message
        value: "value"
    container:
      image: docker/whalesay:latest
    outputs:
      parameters:
      - name: outparam
        valueFrom:
          path: /etc/hosts
  - name: stepref
    steps:
    - - name: one
        template: whalesay
    - - name: two
        template: whalesay
        arguments:
          parameters:
          - name: message
            value: "{{steps.one.outparam}}"
"#;

    #[test]
    fn test_unreachable_templates_are_not_resolved() {
        assert_eq!(validate(STEP_OUTPUT_REFERENCES), Ok(()));
    }

    const STEP_OUTPUT_IN_SCOPE: &str = r#"
metadata:
  name: step-outputs
spec:
  entrypoint: main
  templates:
  - name: produce
    container:
      image: alpine
    outputs:
      parameters:
      - name: out
        valueFrom:
          path: /tmp/out
  - name: consume
    inputs:
      parameters:
      - name: message
    container:
      image: alpine
      args: ["{{inputs.parameters.message}}"]
  - name: main
    steps:
    - - name: one
        template: produce
    - - name: two
        template: consume
        arguments:
          parameters:
          - name: message
            value: "{{steps.one.outputs.parameters.out}}"
"#;

    #[test]
    fn test_step_outputs_enter_scope_after_their_group() {
        assert_eq!(validate(STEP_OUTPUT_IN_SCOPE), Ok(()));

        // The same reference inside the producing group is out of scope
        let mut wf = parse(STEP_OUTPUT_IN_SCOPE);
        let main = wf.spec.templates.iter_mut().find(|t| t.name == "main").unwrap();
        let steps = main.steps.as_mut().unwrap();
        let two = steps.remove(1).remove(0);
        steps[0].push(two);
        let err = validate_workflow(&wf, ValidateOpts::default()).unwrap_err();
        assert!(err.to_string().contains("failed to resolve {{steps.one.outputs.parameters.out}}"));
    }

    const UNSATISFIED_PARAM: &str = r"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    inputs:
      parameters:
      - name: message
    container:
      image: docker/whalesay:latest
";

    #[test]
    fn test_unsatisfied_param() {
        assert_rejected(UNSATISFIED_PARAM, "not supplied");
    }

    const GLOBAL_PARAM: &str = r#"
metadata:
  generateName: global-parameters-complex-
spec:
  entrypoint: test-managed
  arguments:
    parameters:
    - name: message1
      value: hello world
    - name: message2
      value: foo bar
  templates:
  - name: test-managed
    inputs:
      parameters:
      - name: message1
      - name: message-internal
        value: "{{managed.parameters.message1}}"
    steps:
    - - name: step1
        template: whalesay
        arguments:
          parameters:
          - name: message1
            value: world hello
          - name: message2
            value: "{{inputs.parameters.message1}}"
          - name: message3
            value: "{{managed.parameters.message2}}"
          - name: message4
            value: "{{inputs.parameters.message-internal}}"
  - name: whalesay
    inputs:
      parameters:
      - name: message1
      - name: message2
      - name: message3
      - name: message4
    container:
      image: docker/whalesay:latest
      command: [cowsay]
      args: ["Global 1: {{managed.parameters.message1}} Input 1: {{inputs.parameters.message1}} Input 2: {{inputs.parameters.message2}} Input 3: {{inputs.parameters.message3}} Input 4: {{inputs.parameters.message4}}"]
"#;

    #[test]
    fn test_global_param() {
        assert_eq!(validate(GLOBAL_PARAM), Ok(()));
    }

    const INVALID_TEMPLATE_NAMES: &str = r"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay_d
  templates:
  - name: whalesay_d
    inputs:
      parameters:
      - name: message
    container:
      image: docker/whalesay:latest
";

    const INVALID_ARG_PARAM_NAMES: &str = r"
metadata:
  generateName: hello-world-
spec:
  entrypoint: whalesay
  arguments:
    parameters:
    - name: param#1
      value: paramValue
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    const INVALID_ARG_ART_NAMES: &str = r"
metadata:
  generateName: arguments-artifacts-
spec:
  entrypoint: kubectl-input-artifact
  arguments:
    artifacts:
    - name: -kubectl
      http:
        url: https://storage.googleapis.com/kubernetes-release/release/v1.8.0/bin/linux/amd64/kubectl
  templates:
  - name: kubectl-input-artifact
    inputs:
      artifacts:
      - name: -kubectl
        path: /usr/local/bin/kubectl
    container:
      image: debian:9.4
      command: [sh, -c]
      args: [kubectl version]
";

    const INVALID_STEP_NAMES: &str = r#"
metadata:
  generateName: steps-
spec:
  entrypoint: hello-hello-hello
  templates:
  - name: hello-hello-hello
    steps:
    - - name: hello1.blah
        template: whalesay
        arguments:
          parameters:
          - name: message
            value: "hello1"
  - name: whalesay
    inputs:
      parameters:
      - name: message
    container:
      image: docker/whalesay
      command: [cowsay]
      args: ["{{inputs.parameters.message}}"]
"#;

    const INVALID_INPUT_PARAM_NAMES: &str = r#"
metadata:
  generateName: steps-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    inputs:
      parameters:
      - name: message+123
        default: "abc"
    container:
      image: docker/whalesay
"#;

    const INVALID_INPUT_ART_NAMES: &str = r"
metadata:
  generateName: steps-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    inputs:
      artifacts:
      - name: test(jpg
        path: /test.jpg
        http:
          url: https://commons.wikimedia.org/wiki/File:Example.jpg
    container:
      image: docker/whalesay
";

    const INVALID_OUTPUT_ART_NAMES: &str = r#"
metadata:
  generateName: output-artifact-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
      command: [sh, -c]
      args: ["cowsay hello world | tee /tmp/hello_world.txt"]
    outputs:
      artifacts:
      - name: __1
        path: /tmp/hello_world.txt
"#;

    const INVALID_OUTPUT_PARAM_NAMES: &str = r"
metadata:
  generateName: output-artifact-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
    outputs:
      parameters:
      - name: blah-122lsfj}
        valueFrom:
          path: /tmp/hello_world.txt
";

    #[test]
    fn test_invalid_names() {
        for yaml in [
            INVALID_TEMPLATE_NAMES,
            INVALID_ARG_PARAM_NAMES,
            INVALID_ARG_ART_NAMES,
            INVALID_STEP_NAMES,
            INVALID_INPUT_PARAM_NAMES,
            INVALID_INPUT_ART_NAMES,
            INVALID_OUTPUT_ART_NAMES,
            INVALID_OUTPUT_PARAM_NAMES,
        ] {
            assert_rejected(yaml, INVALID);
        }
    }

    fn output_param(value_from: &str) -> String {
        format!(
            r"
metadata:
  generateName: output-param-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
    outputs:
      parameters:
      - name: outparam
{value_from}"
        )
    }

    const INCOMPATIBLE_VALUE_FROM_PARAM: &str = r"
metadata:
  generateName: output-param-
spec:
  entrypoint: my-steps
  templates:
  - name: my-steps
    steps:
    - - name: step1
        template: whalesay
    outputs:
      parameters:
      - name: myoutput
        valueFrom:
          path: /abc
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    #[test]
    fn test_invalid_output_param() {
        assert_rejected(&output_param(""), "valueFrom not specified");
        assert_rejected(
            &output_param("        valueFrom: {}\n"),
            "valueFrom not specified",
        );
        assert_rejected(
            &output_param("        valueFrom:\n          path: /abc\n          jqFilter: abc\n"),
            "multiple valueFrom",
        );
        assert_rejected(
            &output_param("        valueFrom:\n          parameter: abc\n"),
            ".path must be specified for Container templates",
        );
        assert_rejected(
            INCOMPATIBLE_VALUE_FROM_PARAM,
            ".parameter must be specified for Steps templates",
        );
        assert_eq!(
            validate(&output_param("        valueFrom:\n          path: /abc\n")),
            Ok(())
        );
    }

    const MULTIPLE_TEMPLATE_TYPES: &str = r"
metadata:
  generateName: multiple-template-types-
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
    script:
      image: python:alpine3.6
      command: [python]
      source: |
        import random
        print(random.randint(1, 100))
";

    #[test]
    fn test_multiple_template_types() {
        assert_rejected(MULTIPLE_TEMPLATE_TYPES, "multiple template types specified");
    }

    const EXIT_HANDLER_STATUS_ON_EXIT: &str = r#"
metadata:
  generateName: exit-handlers-
spec:
  entrypoint: pass
  onExit: fail
  templates:
  - name: pass
    container:
      image: alpine:latest
      command: [sh, -c]
      args: ["exit 0"]
  - name: fail
    container:
      image: alpine:latest
      command: [sh, -c]
      args: ["echo {{managed.status}} {{managed.uid}}"]
"#;

    const STATUS_NOT_ON_EXIT: &str = r#"
metadata:
  generateName: exit-handlers-
spec:
  entrypoint: pass
  templates:
  - name: pass
    container:
      image: alpine:latest
      command: [sh, -c]
      args: ["echo {{managed.status}}"]
"#;

    #[test]
    fn test_status_only_resolves_in_exit_handler() {
        assert_rejected(STATUS_NOT_ON_EXIT, "failed to resolve {{managed.status}}");
        assert_eq!(validate(EXIT_HANDLER_STATUS_ON_EXIT), Ok(()));
    }

    #[test]
    fn test_exit_handler_template_is_checked_both_ways() {
        // The exit handler template also used as entrypoint has no status there
        let mut wf = parse(EXIT_HANDLER_STATUS_ON_EXIT);
        wf.spec.entrypoint = "fail".into();
        let err = validate_workflow(&wf, ValidateOpts::default()).unwrap_err();
        assert!(err.to_string().contains("managed.status"));
    }

    const VOLUME_MOUNT_ARTIFACT_PATH_COLLISION: &str = r#"
metadata:
  generateName: path-collision-
spec:
  volumeClaimTemplates:
  - metadata:
      name: workdir
    spec:
      accessModes: [ "ReadWriteOnce" ]
      resources:
        requests:
          storage: 1Gi
  entrypoint: pass
  templates:
  - name: pass
    inputs:
      artifacts:
      - name: kubext-source
        path: /src
        git:
          repo: https://github.com/kubext/kubext.git
    container:
      image: alpine:latest
      command: [sh, -c]
      args: ["exit 0"]
      volumeMounts:
      - name: workdir
        mountPath: /src
"#;

    #[test]
    fn test_volume_mount_artifact_path_collision() {
        assert_rejected(VOLUME_MOUNT_ARTIFACT_PATH_COLLISION, "already mounted");

        let mut wf = parse(VOLUME_MOUNT_ARTIFACT_PATH_COLLISION);
        wf.spec.templates[0]
            .container
            .as_mut()
            .unwrap()
            .volume_mounts[0]
            .mount_path = "/differentpath".into();
        assert_eq!(validate_workflow(&wf, ValidateOpts::default()), Ok(()));
    }

    fn with_deadline(secs: i64) -> String {
        format!(
            r#"
metadata:
  generateName: active-deadline-seconds-
spec:
  entrypoint: pass
  templates:
  - name: pass
    activeDeadlineSeconds: {secs}
    container:
      image: alpine:latest
      command: [sh, -c]
      args: ["exit 0"]
"#
        )
    }

    #[test]
    fn test_active_deadline_seconds() {
        assert_rejected(
            &with_deadline(-1),
            "activeDeadlineSeconds must be a positive integer > 0",
        );
        assert_rejected(
            &with_deadline(0),
            "activeDeadlineSeconds must be a positive integer > 0",
        );
        assert_eq!(validate(&with_deadline(1)), Ok(()));
    }

    const LEAF_WITH_PARALLELISM: &str = r"
metadata:
  name: leaf-with-parallelism
spec:
  entrypoint: leaf-with-parallelism
  templates:
  - name: leaf-with-parallelism
    parallelism: 2
    container:
      image: debian:9.4
";

    const NON_LEAF_WITH_RETRY_STRATEGY: &str = r"
metadata:
  name: non-leaf-with-retry-strategy
spec:
  entrypoint: non-leaf-with-retry-strategy
  templates:
  - name: non-leaf-with-retry-strategy
    retryStrategy:
      limit: 4
    steps:
    - - name: try
        template: try
  - name: try
    container:
      image: debian:9.4
";

    #[test]
    fn test_policy_placement() {
        assert_rejected(LEAF_WITH_PARALLELISM, "is only valid");
        assert_rejected(NON_LEAF_WITH_RETRY_STRATEGY, "is only valid");
    }

    const STEPS_ARGUMENT_NO_FROM_OR_LOCATION: &str = r"
metadata:
  generateName: output-artifact-
spec:
  entrypoint: no-location-or-from
  templates:
  - name: no-location-or-from
    steps:
    - - name: whalesay
        template: whalesay
        arguments:
          artifacts:
          - name: art
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    const DAG_ARGUMENT_NO_FROM_OR_LOCATION: &str = r"
metadata:
  generateName: output-artifact-
spec:
  entrypoint: no-location-or-from
  templates:
  - name: no-location-or-from
    dag:
      tasks:
      - name: whalesay
        template: whalesay
        arguments:
          artifacts:
          - name: art
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    const ARGUMENT_NO_VALUE: &str = r"
metadata:
  generateName: output-artifact-
spec:
  entrypoint: no-location-or-from
  templates:
  - name: no-location-or-from
    steps:
    - - name: whalesay
        template: whalesay
        arguments:
          parameters:
          - name: art
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    #[test]
    fn test_arguments_need_values() {
        assert_rejected(
            STEPS_ARGUMENT_NO_FROM_OR_LOCATION,
            "from or artifact location is required",
        );
        assert_rejected(
            DAG_ARGUMENT_NO_FROM_OR_LOCATION,
            "from or artifact location is required",
        );
        assert_rejected(ARGUMENT_NO_VALUE, ".value is required");
    }

    fn with_items(items: &str) -> String {
        format!(
            r#"
metadata:
  generateName: loops-
spec:
  entrypoint: loop-example
  templates:
  - name: loop-example
    steps:
    - - name: print-message
        template: whalesay
        arguments:
          parameters:
          - name: message
            value: "{{{{item}}}}"
        withItems: {items}
  - name: whalesay
    inputs:
      parameters:
      - name: message
    container:
      image: docker/whalesay:latest
      command: [cowsay]
      args: ["{{{{inputs.parameters.message}}}}"]
"#
        )
    }

    #[test]
    fn test_with_items() {
        assert_eq!(validate(&with_items("[0, false, string, 1.2]")), Ok(()));
        assert_rejected(
            &with_items("[hello world, goodbye world, [a, b, c]]"),
            "withItems",
        );
        assert_rejected(&with_items("[{os: linux}]"), "withItems");
    }

    #[test]
    fn test_item_outside_loop_is_unresolved() {
        let yaml = with_items("[]");
        assert_rejected(&yaml, "failed to resolve {{item}}");
    }

    const POD_NAME_VARIABLE: &str = r#"
metadata:
  name: pod-name-variable
spec:
  entrypoint: pod-name-variable
  templates:
  - name: pod-name-variable
    container:
      image: debian:9.4
      command: [sh, -c]
      args: ["kubectl {{pod.name}}"]
    outputs:
      artifacts:
      - name: my-out
        path: /tmp/hello_world.txt
        s3:
          endpoint: s3.amazonaws.com
          bucket: my-bucket
          key: path/{{pod.name}}/hello_world.tgz
          accessKeySecret:
            name: my-s3-credentials
            key: accessKey
          secretKeySecret:
            name: my-s3-credentials
            key: secretKey
"#;

    #[test]
    fn test_pod_name_variable() {
        assert_eq!(validate(POD_NAME_VARIABLE), Ok(()));
    }

    const SPEC_ARGUMENT_NO_VALUE: &str = r"
metadata:
  generateName: spec-arg-no-value-
spec:
  entrypoint: whalesay
  arguments:
    parameters:
    - name: required-param
  templates:
  - name: whalesay
    container:
      image: docker/whalesay:latest
";

    #[test]
    fn test_spec_argument_value_relaxed_when_linting() {
        let wf = parse(SPEC_ARGUMENT_NO_VALUE);
        assert_eq!(validate_workflow(&wf, ValidateOpts::lint()), Ok(()));
        let err = validate_workflow(&wf, ValidateOpts::default()).unwrap_err();
        assert!(err.to_string().contains(".value is required"));
    }

    const DAG_DIAMOND: &str = r#"
metadata:
  name: dag-diamond
spec:
  entrypoint: diamond
  templates:
  - name: echo
    inputs:
      parameters:
      - name: message
    container:
      image: alpine:3.7
      command: [echo, "{{inputs.parameters.message}}"]
    outputs:
      parameters:
      - name: said
        valueFrom:
          path: /tmp/said
  - name: diamond
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
          parameters: [{name: message, value: "{{tasks.A.outputs.parameters.said}}"}]
      - name: C
        dependencies: [A]
        template: echo
        arguments:
          parameters: [{name: message, value: C}]
      - name: D
        dependencies: [B, C]
        template: echo
        arguments:
          parameters: [{name: message, value: "{{tasks.B.outputs.parameters.said}}"}]
    outputs:
      parameters:
      - name: last
        valueFrom:
          parameter: "{{tasks.D.outputs.parameters.said}}"
"#;

    #[test]
    fn test_dag_ancestors_in_scope() {
        assert_eq!(validate(DAG_DIAMOND), Ok(()));

        // C does not depend on B
        let yaml = DAG_DIAMOND.replacen("value: C}", "value: \"{{tasks.B.outputs.parameters.said}}\"}", 1);
        assert_rejected(&yaml, "failed to resolve {{tasks.B.outputs.parameters.said}}");
    }

    #[test]
    fn test_dag_cycle_and_undefined_dependency() {
        let cyclic = DAG_DIAMOND.replacen("dependencies: [A]\n        template: echo\n        arguments:\n          parameters: [{name: message, value: \"{{tasks.A", "dependencies: [D]\n        template: echo\n        arguments:\n          parameters: [{name: message, value: \"{{tasks.A", 1);
        assert_rejected(&cyclic, "cycle");

        let undefined = DAG_DIAMOND.replacen("dependencies: [B, C]", "dependencies: [B, Z]", 1);
        assert_rejected(&undefined, "dependency 'Z' of task 'D' not defined");
    }

    #[test]
    fn test_entrypoint_and_on_exit_must_exist() {
        let mut wf = parse(POD_NAME_VARIABLE);
        wf.spec.entrypoint = "missing".into();
        let err = validate_workflow(&wf, ValidateOpts::default()).unwrap_err();
        assert!(err.to_string().contains("spec.entrypoint template 'missing' undefined"));

        let mut wf = parse(POD_NAME_VARIABLE);
        wf.spec.on_exit = Some("missing".into());
        let err = validate_workflow(&wf, ValidateOpts::default()).unwrap_err();
        assert!(err.to_string().contains("spec.onExit template 'missing' undefined"));
    }
}
