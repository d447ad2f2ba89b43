use crate::k8s::workload::Workload;
use anyhow::{Context, Result};
use serde_json::Value;

const ANNOTATION_REVISION: &str = "deployment.kubernetes.io/revision";
const ANNOTATION_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Strips server-owned fields (`status`, `metadata.generation`,
/// `metadata.uid`, `metadata.resourceVersion`) and two noisy annotations
/// from a workload's JSON representation. The result is small enough and
/// stable enough to be stored in an annotation on the live object (spec.md
/// §3's `rollback-manifest`) and to re-apply cleanly via `Update`.
///
/// Grounded on `pkg/debug/k8s.go`'s `getCurrentManifestSnapshot`.
pub fn snapshot_value<W: Workload>(workload: &W) -> Result<Value> {
    let mut value = serde_json::to_value(workload).context("failed to serialize workload")?;

    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");

        if let Some(metadata) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("generation");
            metadata.remove("uid");
            metadata.remove("resourceVersion");

            if let Some(annotations) = metadata.get_mut("annotations").and_then(Value::as_object_mut)
            {
                annotations.remove(ANNOTATION_REVISION);
                annotations.remove(ANNOTATION_LAST_APPLIED);
            }
        }
    }

    Ok(value)
}

/// Serializes the stripped value to a compact JSON string — the exact form
/// stored in the `rollback-manifest` annotation.
pub fn snapshot_string<W: Workload>(workload: &W) -> Result<String> {
    let value = snapshot_value(workload)?;
    serde_json::to_string(&value).context("failed to marshal snapshot")
}

/// Decodes a stored snapshot back into a typed workload, ready for an
/// `Update` call. Fails if the stored JSON doesn't decode into `W` — callers
/// are expected to have recorded which kind produced the snapshot.
pub fn restore_from_snapshot<W: Workload>(snapshot: &str) -> Result<W> {
    serde_json::from_str(snapshot).context("failed to decode rollback manifest")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        Deployment, DeploymentSpec, DeploymentStatus, DeploymentStrategy,
    };
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    fn sample_deployment() -> Deployment {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_REVISION.to_string(), "7".to_string());
        annotations.insert(
            ANNOTATION_LAST_APPLIED.to_string(),
            "{\"huge\":\"blob\"}".to_string(),
        );
        annotations.insert("team".to_string(), "payments".to_string());

        let mut match_labels = BTreeMap::new();
        match_labels.insert("app".to_string(), "api".to_string());

        Deployment {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("team-a".to_string()),
                annotations: Some(annotations),
                generation: Some(12),
                uid: Some("abc-123".to_string()),
                resource_version: Some("999".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                selector: LabelSelector {
                    match_labels: Some(match_labels),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".to_string(),
                            image: Some("acme/api:1.2".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                replicas: Some(3),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn snapshot_strips_server_owned_fields_and_noisy_annotations() {
        let deployment = sample_deployment();
        let value = snapshot_value(&deployment).unwrap();

        assert!(value.get("status").is_none());
        let metadata = value.get("metadata").unwrap().as_object().unwrap();
        assert!(metadata.get("generation").is_none());
        assert!(metadata.get("uid").is_none());
        assert!(metadata.get("resourceVersion").is_none());

        let annotations = metadata.get("annotations").unwrap().as_object().unwrap();
        assert!(annotations.get(ANNOTATION_REVISION).is_none());
        assert!(annotations.get(ANNOTATION_LAST_APPLIED).is_none());
        assert_eq!(annotations.get("team").unwrap(), "payments");
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let deployment = sample_deployment();
        let snapshot_one = snapshot_string(&deployment).unwrap();

        let restored: Deployment = restore_from_snapshot(&snapshot_one).unwrap();
        let snapshot_two = snapshot_string(&restored).unwrap();

        assert_eq!(snapshot_one, snapshot_two);
    }
}
