use crate::k8s::workload::Workload;
use crate::session::types::Mode;
use std::collections::BTreeMap;

/// The active-session marker read off a workload's annotations/labels,
/// identifying which mode (if any) currently owns it and on which
/// container. Grounded on spec.md §3's `SessionMarkers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMarker {
    pub mode: Mode,
    pub container: String,
}

const ACTIVE_SUFFIX: &str = "active";
const STARTED_AT_SUFFIX: &str = "started-at";
const CONTAINER_SUFFIX: &str = "container";
const ROLLBACK_SUFFIX: &str = "rollback-manifest";
pub const SERVICE_LABEL: &str = "service";

fn annotation(prefix: &str, suffix: &str) -> String {
    format!("{prefix}{suffix}")
}

/// Reads whichever of the two mode prefixes is present and carries
/// `active=true`, returning the owning mode and the container it's bound
/// to. Both prefixes present simultaneously should never happen (preflight
/// prevents it), but if it does, remote-dev is reported first.
pub fn read_active_marker<W: Workload>(workload: &W) -> Option<ActiveMarker> {
    let labels = workload.labels_map();
    let annotations = workload.annotations_map();

    for mode in [Mode::RemoteDev, Mode::Debug] {
        let prefix = mode.annotation_prefix();
        let is_active = labels
            .get(&annotation(prefix, ACTIVE_SUFFIX))
            .map(|v| v == "true")
            .unwrap_or(false);
        if !is_active {
            continue;
        }
        let container = annotations
            .get(&annotation(prefix, CONTAINER_SUFFIX))
            .cloned()
            .unwrap_or_default();
        return Some(ActiveMarker { mode, container });
    }
    None
}

pub fn read_rollback_manifest<W: Workload>(workload: &W, mode: Mode) -> Option<String> {
    workload
        .annotations_map()
        .get(&annotation(mode.annotation_prefix(), ROLLBACK_SUFFIX))
        .cloned()
}

/// Workload-level labels/annotations to merge onto the live object: active
/// marker, start time, bound container, and (written once) the rollback
/// snapshot. `rollback_manifest` is `None` on a same-session reuse where a
/// snapshot already exists and must not be overwritten.
pub fn workload_markers(
    mode: Mode,
    container: &str,
    started_at: i64,
    rollback_manifest: Option<&str>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let prefix = mode.annotation_prefix();
    let mut labels = BTreeMap::new();
    labels.insert(annotation(prefix, ACTIVE_SUFFIX), "true".to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(annotation(prefix, STARTED_AT_SUFFIX), started_at.to_string());
    annotations.insert(annotation(prefix, CONTAINER_SUFFIX), container.to_string());
    if let Some(manifest) = rollback_manifest {
        annotations.insert(annotation(prefix, ROLLBACK_SUFFIX), manifest.to_string());
    }

    (labels, annotations)
}

/// Pod-template-level labels/annotations: same active/started-at/container
/// triple, plus a `service` label for pod discovery via the workload name.
pub fn pod_template_markers(
    mode: Mode,
    container: &str,
    started_at: i64,
    workload_name: &str,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let (mut labels, annotations) = workload_markers(mode, container, started_at, None);
    labels.insert(SERVICE_LABEL.to_string(), workload_name.to_string());
    (labels, annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

    fn deployment_with(labels: BTreeMap<String, String>, annotations: BTreeMap<String, String>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("team-a".to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                selector: LabelSelector::default(),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn reads_no_marker_on_fresh_workload() {
        let deployment = deployment_with(BTreeMap::new(), BTreeMap::new());
        assert!(read_active_marker(&deployment).is_none());
    }

    #[test]
    fn reads_remote_dev_marker() {
        let mut labels = BTreeMap::new();
        labels.insert("remote-dev.bunnyshell.com/active".to_string(), "true".to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert("remote-dev.bunnyshell.com/container".to_string(), "web".to_string());

        let deployment = deployment_with(labels, annotations);
        let marker = read_active_marker(&deployment).unwrap();
        assert_eq!(marker.mode, Mode::RemoteDev);
        assert_eq!(marker.container, "web");
    }

    #[test]
    fn reads_debug_marker() {
        let mut labels = BTreeMap::new();
        labels.insert("debug.bunnyshell.com/active".to_string(), "true".to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert("debug.bunnyshell.com/container".to_string(), "sidecar".to_string());

        let deployment = deployment_with(labels, annotations);
        let marker = read_active_marker(&deployment).unwrap();
        assert_eq!(marker.mode, Mode::Debug);
        assert_eq!(marker.container, "sidecar");
    }
}
