//! Building the pod that executes a leaf node.

use serde_json::json;
use thiserror::Error;

use crate::domain::models::constants::{
    ANNOTATION_KEY_NODE_NAME, ANNOTATION_KEY_TEMPLATE, ENV_VAR_NAMESPACE, ENV_VAR_POD_IP,
    ENV_VAR_POD_NAME, EXECUTOR_ARTIFACT_BASE_DIR, EXECUTOR_COMMAND,
    EXECUTOR_RESOURCE_MANIFEST_PATH, EXECUTOR_SCRIPT_SOURCE_PATH, EXECUTOR_STAGING_EMPTY_DIR,
    INIT_CONTAINER_NAME, INPUT_ARTIFACTS_VOLUME_NAME, LABEL_KEY_COMPLETED,
    LABEL_KEY_CONTROLLER_INSTANCE_ID, LABEL_KEY_WORKFLOW, LOCAL_VAR_POD_NAME, MAIN_CONTAINER_NAME,
    POD_METADATA_ANNOTATIONS_VOLUME_PATH, POD_METADATA_MOUNT_PATH, POD_METADATA_VOLUME_NAME,
    STAGING_VOLUME_NAME, WAIT_CONTAINER_NAME,
};
use crate::domain::models::{
    ArtifactRepository, Container, ControllerConfig, EnvVar, ObjectMeta, Pod, PodSpec, PodStatus,
    S3Artifact, Template, TemplateBody, Volume, VolumeMount, Workflow,
};
use crate::domain::models::template::ArtifactoryArtifact;
use crate::services::substitution::{substitute, Scope, SubstitutionError};

#[derive(Debug, Error)]
pub enum PodBuildError {
    #[error("volume '{0}' not found in workflow spec")]
    VolumeNotFound(String),

    #[error("template '{0}' is not a leaf template")]
    NotLeaf(String),

    #[error(transparent)]
    Substitution(#[from] SubstitutionError),

    #[error("failed to encode template: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Build the pod for the leaf node `node_name`. The pod is named after the node id.
pub fn build_pod(
    wf: &Workflow,
    node_name: &str,
    tmpl: &Template,
    config: &ControllerConfig,
) -> Result<Pod, PodBuildError> {
    let pod_name = wf.node_id(node_name);
    let scope = Scope::from([(LOCAL_VAR_POD_NAME.to_string(), pod_name.clone())]);
    let mut tmpl = substitute(tmpl, &scope, false)?;
    add_default_artifact_locations(&mut tmpl, &config.artifact_repository, wf, &pod_name);

    let mut volumes = vec![pod_metadata_volume()];
    let mut main = main_container(&tmpl, config)?;
    let init = (tmpl.script.is_some() || !tmpl.inputs.artifacts.is_empty())
        .then(|| init_container(&tmpl, config));

    if tmpl.script.is_some() {
        volumes.push(Volume::new(STAGING_VOLUME_NAME, json!({ "emptyDir": {} })));
        main.args.push(EXECUTOR_SCRIPT_SOURCE_PATH.to_string());
        main.volume_mounts.push(VolumeMount {
            name: STAGING_VOLUME_NAME.to_string(),
            mount_path: EXECUTOR_STAGING_EMPTY_DIR.to_string(),
            read_only: false,
            sub_path: None,
        });
    }
    if !tmpl.inputs.artifacts.is_empty() {
        volumes.push(Volume::new(INPUT_ARTIFACTS_VOLUME_NAME, json!({ "emptyDir": {} })));
        for art in &tmpl.inputs.artifacts {
            let Some(path) = &art.path else {
                continue;
            };
            main.volume_mounts.push(VolumeMount {
                name: INPUT_ARTIFACTS_VOLUME_NAME.to_string(),
                mount_path: path.clone(),
                read_only: false,
                sub_path: Some(art.name.clone()),
            });
        }
    }
    add_workflow_volumes(wf, &main, &mut volumes)?;

    let mut labels = tmpl.metadata.labels.clone();
    labels.insert(LABEL_KEY_WORKFLOW.to_string(), wf.metadata.name.clone());
    labels.insert(LABEL_KEY_COMPLETED.to_string(), "false".to_string());
    if let Some(instance_id) = &config.instance_id {
        labels.insert(LABEL_KEY_CONTROLLER_INSTANCE_ID.to_string(), instance_id.clone());
    }
    let mut annotations = tmpl.metadata.annotations.clone();
    annotations.insert(ANNOTATION_KEY_NODE_NAME.to_string(), node_name.to_string());
    annotations.insert(ANNOTATION_KEY_TEMPLATE.to_string(), serde_json::to_string(&tmpl)?);

    let mut node_selector = wf.spec.node_selector.clone();
    node_selector.extend(tmpl.node_selector.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            labels,
            annotations,
            owner_references: vec![wf.controller_ref()],
            ..ObjectMeta::named(wf.metadata.namespace.clone(), pod_name)
        },
        spec: PodSpec {
            init_containers: init.into_iter().collect(),
            containers: vec![wait_container(config), main],
            volumes,
            restart_policy: Some("Never".to_string()),
            service_account_name: wf.spec.service_account_name.clone(),
            active_deadline_seconds: tmpl.active_deadline_seconds,
            node_selector,
        },
        status: PodStatus::default(),
    })
}

fn main_container(tmpl: &Template, config: &ControllerConfig) -> Result<Container, PodBuildError> {
    let mut main = match tmpl.body() {
        Ok(TemplateBody::Container(container)) => container.clone(),
        Ok(TemplateBody::Script(script)) => script.container.clone(),
        Ok(TemplateBody::Resource(_)) => {
            let mut ctr = executor_container(MAIN_CONTAINER_NAME, config);
            ctr.args = vec![
                "resource".to_string(),
                EXECUTOR_RESOURCE_MANIFEST_PATH.to_string(),
            ];
            ctr
        }
        _ => return Err(PodBuildError::NotLeaf(tmpl.name.clone())),
    };
    main.name = MAIN_CONTAINER_NAME.to_string();
    Ok(main)
}

fn executor_container(name: &str, config: &ControllerConfig) -> Container {
    Container {
        name: name.to_string(),
        image: config.executor_image.clone(),
        command: vec![EXECUTOR_COMMAND.to_string()],
        env: vec![
            EnvVar::field_ref(ENV_VAR_POD_NAME, "metadata.name"),
            EnvVar::field_ref(ENV_VAR_NAMESPACE, "metadata.namespace"),
        ],
        resources: config.executor_resources.clone(),
        ..Container::default()
    }
}

fn pod_metadata_mount() -> VolumeMount {
    VolumeMount {
        name: POD_METADATA_VOLUME_NAME.to_string(),
        mount_path: POD_METADATA_MOUNT_PATH.to_string(),
        read_only: false,
        sub_path: None,
    }
}

fn wait_container(config: &ControllerConfig) -> Container {
    let mut ctr = executor_container(WAIT_CONTAINER_NAME, config);
    ctr.args = vec!["wait".to_string()];
    ctr.env.push(EnvVar::field_ref(ENV_VAR_POD_IP, "status.podIP"));
    ctr.volume_mounts.push(pod_metadata_mount());
    ctr
}

/// Stages script sources and downloads input artifacts before main starts.
fn init_container(tmpl: &Template, config: &ControllerConfig) -> Container {
    let mut ctr = executor_container(INIT_CONTAINER_NAME, config);
    ctr.args = vec!["init".to_string()];
    ctr.volume_mounts.push(pod_metadata_mount());
    if tmpl.script.is_some() {
        ctr.volume_mounts.push(VolumeMount {
            name: STAGING_VOLUME_NAME.to_string(),
            mount_path: EXECUTOR_STAGING_EMPTY_DIR.to_string(),
            read_only: false,
            sub_path: None,
        });
    }
    if !tmpl.inputs.artifacts.is_empty() {
        ctr.volume_mounts.push(VolumeMount {
            name: INPUT_ARTIFACTS_VOLUME_NAME.to_string(),
            mount_path: EXECUTOR_ARTIFACT_BASE_DIR.to_string(),
            read_only: false,
            sub_path: None,
        });
    }
    ctr
}

fn pod_metadata_volume() -> Volume {
    Volume::new(
        POD_METADATA_VOLUME_NAME,
        json!({
            "downwardAPI": {
                "items": [{
                    "path": POD_METADATA_ANNOTATIONS_VOLUME_PATH,
                    "fieldRef": { "fieldPath": "metadata.annotations" }
                }]
            }
        }),
    )
}

/// Attach the workflow volumes and claims the main container mounts.
fn add_workflow_volumes(
    wf: &Workflow,
    main: &Container,
    volumes: &mut Vec<Volume>,
) -> Result<(), PodBuildError> {
    for mount in &main.volume_mounts {
        if volumes.iter().any(|v| v.name == mount.name) {
            continue;
        }
        let volume = wf
            .spec
            .volumes
            .iter()
            .chain(&wf.status.persistent_volume_claims)
            .find(|v| v.name == mount.name)
            .ok_or_else(|| PodBuildError::VolumeNotFound(mount.name.clone()))?;
        volumes.push(volume.clone());
    }
    Ok(())
}

/// Output artifacts without a location go to the configured repository
/// under `<keyPrefix>/<workflow>/<pod>/<artifact>.tgz`.
fn add_default_artifact_locations(
    tmpl: &mut Template,
    repo: &ArtifactRepository,
    wf: &Workflow,
    pod_name: &str,
) {
    for art in &mut tmpl.outputs.artifacts {
        if art.has_location() {
            continue;
        }
        let key = format!("{}/{pod_name}/{}.tgz", wf.metadata.name, art.name);
        if let Some(s3) = &repo.s3 {
            let key = if s3.key_prefix.is_empty() {
                key
            } else {
                format!("{}/{key}", s3.key_prefix.trim_end_matches('/'))
            };
            art.location.s3 = Some(S3Artifact {
                bucket: s3.bucket.clone(),
                key,
            });
        } else if let Some(artifactory) = &repo.artifactory {
            art.location.artifactory = Some(ArtifactoryArtifact {
                url: format!("{}/{key}", artifactory.repo_url.trim_end_matches('/')),
            });
        }
    }
}
