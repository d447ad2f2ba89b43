use crate::errors::{PodwireError, Result};
use crate::k8s::workload::Workload;
use crate::session::markers::{pod_template_markers, workload_markers};
use crate::session::types::{Session, WorkloadKind};
use anyhow::Context;
use kube::api::Patch;
use md5::{Digest, Md5};
use serde_json::{json, Value};

pub const SECRET_NAME: &str = "remote-development";
pub const SECRET_AUTHORIZED_KEYS_KEY: &str = "authorized_keys";
const SECRET_AUTHORIZED_KEYS_MOUNT_PATH: &str = "ssh/authorized_keys";

const VOLUME_BIN: &str = "remote-dev-bin";
const VOLUME_CONFIG: &str = "remote-dev-config";
const VOLUME_WORK: &str = "remote-dev-work";

const CONTAINER_BIN: &str = "remote-dev-bin";
const CONTAINER_WORK_PERMISSIONS: &str = "remote-dev-work-permissions";
const CONTAINER_WORK: &str = "remote-dev-work";

const BINARIES_IMAGE: &str = "public.ecr.aws/x0p9x6p7/bunnyshell/remote-binaries:latest";
const WORK_PERMISSIONS_IMAGE: &str = "busybox:1.36";
const BIN_MOUNT_PATH: &str = "/remote-dev-bin";

const BASE_PATH: &str = "/opt/bunnyshell";

/// `H = hex(MD5(remoteSyncPath))` — ties the init container's populated
/// data area to the target container's subPath mount. Must be computed
/// identically everywhere it's needed.
pub fn path_hash(remote_sync_path: &str) -> String {
    let digest = Md5::digest(remote_sync_path.as_bytes());
    hex::encode(digest)
}

/// First 16 hex characters of `MD5(remoteSyncPath-workloadName-namespace)` —
/// the stable session name handed to the sync engine.
pub fn sync_session_name(remote_sync_path: &str, workload_name: &str, namespace: &str) -> String {
    let input = format!("{remote_sync_path}-{workload_name}-{namespace}");
    let digest = Md5::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn pvc_name(kind: WorkloadKind, workload_name: &str) -> String {
    format!("{}-{}-remote-dev", kind.as_str().to_lowercase(), workload_name)
}

fn strategy_field(kind: WorkloadKind) -> &'static str {
    match kind {
        WorkloadKind::Deployment => "strategy",
        WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => "updateStrategy",
    }
}

fn strategy_type(kind: WorkloadKind) -> &'static str {
    match kind {
        WorkloadKind::Deployment => "Recreate",
        WorkloadKind::StatefulSet | WorkloadKind::DaemonSet => "OnDelete",
    }
}

/// Workload-level labels/annotations set on every patched object, per the
/// session markers data model (spec.md §3). Shared by both modes.
fn session_markers(session: &Session) -> (Value, Value) {
    let (labels, annotations) = workload_markers(
        session.mode,
        &session.container.name,
        session.started_at,
        None,
    );
    (to_json_map(labels), to_json_map(annotations))
}

/// Pod-template-level labels/annotations: same triple plus the `service`
/// label pod discovery keys off of (spec.md §3).
fn template_markers(session: &Session) -> (Value, Value) {
    let (labels, annotations) = pod_template_markers(
        session.mode,
        &session.container.name,
        session.started_at,
        &session.workload.name,
    );
    (to_json_map(labels), to_json_map(annotations))
}

fn to_json_map(map: std::collections::BTreeMap<String, String>) -> Value {
    Value::Object(map.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

fn exec_true_probe() -> Value {
    json!({
        "exec": { "command": ["true"] },
        "periodSeconds": 5,
    })
}

/// Builds the strategic-merge patch for remote-dev mode: controller
/// strategy, replicas, and a pod template rebuilt with three volumes, three
/// init containers, and a rewritten target container.
///
/// Grounded on `pkg/remote/k8s.go`'s `prepareDeployment`/`preparePodTemplateSpec`
/// family, extended to the third init container spec.md adds (work
/// permissions) and generalized across the three workload kinds.
pub fn build_remote_dev_patch<W: Workload>(workload: &W, session: &Session) -> Result<Value> {
    let remote_sync_path = session
        .remote_sync_path
        .as_deref()
        .ok_or(PodwireError::NoResourceSelected)?;
    let hash = path_hash(remote_sync_path);
    let container_name = &session.container.name;
    let container_image = &session.container.image;

    let (labels, annotations) = session_markers(session);
    let (template_labels, template_annotations) = template_markers(session);

    let bin_mount_target = format!("{BASE_PATH}/bin");
    let secret_mount_target = format!("{BASE_PATH}/secret");
    let work_mount_point = format!("/volumes/{hash}");

    let pull_policy = if BINARIES_IMAGE.ends_with(":latest") {
        "Always"
    } else {
        "IfNotPresent"
    };

    let mut spec = json!({
        "replicas": 1,
        "template": {
            "metadata": {
                "labels": template_labels,
                "annotations": template_annotations,
            },
            "spec": {
                "volumes": [
                    { "name": VOLUME_BIN, "emptyDir": {} },
                    {
                        "name": VOLUME_CONFIG,
                        "secret": {
                            "secretName": SECRET_NAME,
                            "items": [{
                                "key": SECRET_AUTHORIZED_KEYS_KEY,
                                "path": SECRET_AUTHORIZED_KEYS_MOUNT_PATH,
                            }],
                        },
                    },
                    {
                        "name": VOLUME_WORK,
                        "persistentVolumeClaim": { "claimName": pvc_name(W::KIND, &workload.name()) },
                    },
                ],
                "initContainers": [
                    {
                        "name": CONTAINER_BIN,
                        "image": BINARIES_IMAGE,
                        "imagePullPolicy": pull_policy,
                        "command": ["sh", "-c", format!("cp -p /usr/local/bin/* {BIN_MOUNT_PATH}")],
                        "volumeMounts": [
                            { "name": VOLUME_BIN, "mountPath": BIN_MOUNT_PATH },
                        ],
                    },
                    {
                        "name": CONTAINER_WORK_PERMISSIONS,
                        "image": WORK_PERMISSIONS_IMAGE,
                        "imagePullPolicy": "IfNotPresent",
                        "command": ["sh", "-c", format!("mkdir -p {work_mount_point} && chmod 777 {work_mount_point}")],
                        "volumeMounts": [
                            { "name": VOLUME_WORK, "mountPath": "/volumes" },
                        ],
                    },
                    {
                        "name": CONTAINER_WORK,
                        "image": container_image,
                        "imagePullPolicy": "IfNotPresent",
                        "command": ["sh", "-c", format!(
                            "[ \"$(ls -A {work_mount_point})\" ] || (cp -Rp {remote_sync_path}/. {work_mount_point}; exit 0)"
                        )],
                        "volumeMounts": [
                            { "name": VOLUME_WORK, "mountPath": work_mount_point, "subPath": hash },
                        ],
                    },
                ],
                "containers": [
                    {
                        "name": container_name,
                        "command": [format!("{bin_mount_target}/start.sh")],
                        "livenessProbe": exec_true_probe(),
                        "readinessProbe": exec_true_probe(),
                        "startupProbe": exec_true_probe(),
                        "volumeMounts": [
                            { "name": VOLUME_BIN, "mountPath": bin_mount_target },
                            { "name": VOLUME_CONFIG, "mountPath": secret_mount_target },
                            { "name": VOLUME_WORK, "mountPath": remote_sync_path, "subPath": hash },
                        ],
                    },
                ],
            },
        },
    });

    if let Some(strategy) = spec.as_object_mut() {
        strategy.insert(
            strategy_field(W::KIND).to_string(),
            json!({ "type": strategy_type(W::KIND), "rollingUpdate": null }),
        );
        if W::KIND == WorkloadKind::DaemonSet {
            strategy.remove("replicas");
        }
    }

    Ok(json!({
        "metadata": { "labels": labels, "annotations": annotations },
        "spec": spec,
    }))
}

/// Builds the strategic-merge patch for debug mode: controller strategy
/// plus a rewritten target container command/args, leaving the workload's
/// own volumes and other containers untouched.
///
/// Grounded on `pkg/debug/k8s.go`'s `getResourcePatch`/`prepareContainer`.
pub fn build_debug_patch<W: Workload>(
    _workload: &W,
    session: &Session,
    _container_index: usize,
    is_init: bool,
    env_overrides: &[(String, String)],
    resources: Option<&Value>,
) -> Result<Value> {
    let (labels, annotations) = session_markers(session);
    let (template_labels, template_annotations) = template_markers(session);

    let mut container = json!({
        "name": session.container.name,
        "command": ["sh", "-c", "tail -f /dev/null"],
        "args": Value::Array(vec![]),
    });

    if !env_overrides.is_empty() {
        let env: Vec<Value> = env_overrides
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        container["env"] = Value::Array(env);
    }
    if let Some(resources) = resources {
        container["resources"] = resources.clone();
    }
    if !is_init {
        container["readinessProbe"] = Value::Null;
        container["livenessProbe"] = Value::Null;
        container["startupProbe"] = Value::Null;
    }

    let container_key = if is_init { "initContainers" } else { "containers" };
    // strategic-merge merges the "containers"/"initContainers" list by
    // container name, not by index, so naming the target container here is
    // sufficient to hit the right element.

    let mut spec = json!({
        "template": {
            "metadata": { "labels": template_labels, "annotations": template_annotations },
            "spec": { container_key: [container] },
        },
    });

    if let Some(obj) = spec.as_object_mut() {
        obj.insert(
            strategy_field(W::KIND).to_string(),
            json!({ "type": strategy_type(W::KIND), "rollingUpdate": null }),
        );
        if W::KIND == WorkloadKind::DaemonSet {
            obj.insert("replicas".to_string(), Value::Null);
            obj.remove("replicas");
        } else {
            obj.insert("replicas".to_string(), json!(1));
        }
    }

    Ok(json!({
        "metadata": { "labels": labels, "annotations": annotations },
        "spec": spec,
    }))
}

/// Builds the RFC 6902 follow-up patch that replaces args and the three
/// probe fields at the exact indexed path, so the request succeeds whether
/// or not those fields originally existed (strict strategic-merge can't
/// null out probes the object never had, and the container list in the
/// strategic-merge patch above is keyed by name — but probes must be
/// targeted positionally).
///
/// Grounded on spec.md §4.3's debug reset description and
/// `pkg/debug/k8s.go`'s `resetResourceContainer`.
pub fn build_debug_reset_json_patch(container_index: usize, is_init: bool) -> Value {
    let container_list = if is_init { "initContainers" } else { "containers" };
    let base = format!("/spec/template/spec/{container_list}/{container_index}");

    let mut ops = vec![json!({
        "op": "replace",
        "path": format!("{base}/args"),
        "value": Value::Array(vec![]),
    })];

    if !is_init {
        for field in ["readinessProbe", "livenessProbe", "startupProbe"] {
            ops.push(json!({
                "op": "replace",
                "path": format!("{base}/{field}"),
                "value": Value::Null,
            }));
        }
    }

    Value::Array(ops)
}

pub fn strategic_merge_patch(value: Value) -> Patch<Value> {
    Patch::Strategic(value)
}

/// Wraps a JSON array of RFC 6902 operations (as built by
/// `build_debug_reset_json_patch`) into the `kube` crate's patch type.
pub fn json_patch(ops: Value) -> Result<Patch<Value>> {
    let ops: json_patch::Patch =
        serde_json::from_value(ops).context("failed to deserialize JSON-Patch document")?;
    Ok(Patch::Json(ops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{ContainerRef, Mode, SyncMode, WorkloadRef};

    fn sample_session() -> Session {
        Session {
            mode: Mode::RemoteDev,
            namespace: "team-a".to_string(),
            workload: WorkloadRef {
                kind: WorkloadKind::Deployment,
                name: "api".to_string(),
            },
            container: ContainerRef {
                name: "web".to_string(),
                image: "acme/api:1.2".to_string(),
                is_init: false,
            },
            local_sync_path: Some("./src".to_string()),
            remote_sync_path: Some("/app".to_string()),
            sync_mode: SyncMode::TwoWayResolved,
            port_mappings: vec![],
            wait_timeout_sec: 120,
            started_at: 1_700_000_000,
            force_recreate: false,
        }
    }

    #[test]
    fn path_hash_is_stable_and_shared_between_init_and_target_mount() {
        let session = sample_session();
        let h1 = path_hash(session.remote_sync_path.as_deref().unwrap());
        let h2 = path_hash("/app");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
    }

    #[test]
    fn sync_session_name_is_sixteen_hex_chars() {
        let name = sync_session_name("/app", "api", "team-a");
        assert_eq!(name.len(), 16);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn pvc_name_matches_kind_workload_convention() {
        assert_eq!(pvc_name(WorkloadKind::Deployment, "api"), "deployment-api-remote-dev");
    }

    #[test]
    fn remote_dev_patch_declares_three_init_containers_in_order() {
        use k8s_openapi::api::apps::v1::Deployment;
        let workload = Deployment::default();
        let session = sample_session();
        let patch = build_remote_dev_patch(&workload, &session).unwrap();

        let pod_spec = &patch["spec"]["template"]["spec"];
        let init_containers = pod_spec["initContainers"].as_array().unwrap();
        assert_eq!(init_containers.len(), 3);
        assert_eq!(init_containers[0]["name"], CONTAINER_BIN);
        assert_eq!(init_containers[1]["name"], CONTAINER_WORK_PERMISSIONS);
        assert_eq!(init_containers[2]["name"], CONTAINER_WORK);

        assert_eq!(patch["spec"]["strategy"]["type"], "Recreate");
        assert_eq!(patch["spec"]["replicas"], 1);

        let container = &pod_spec["containers"][0];
        assert_eq!(container["command"][0], "/opt/bunnyshell/bin/start.sh");
    }

    #[test]
    fn remote_dev_patch_template_carries_service_label_workload_does_not() {
        use k8s_openapi::api::apps::v1::Deployment;
        let workload = Deployment::default();
        let session = sample_session();
        let patch = build_remote_dev_patch(&workload, &session).unwrap();

        let template_labels = &patch["spec"]["template"]["metadata"]["labels"];
        assert_eq!(template_labels["service"], "api");
        assert_eq!(template_labels["remote-dev.bunnyshell.com/active"], "true");

        let workload_labels = &patch["metadata"]["labels"];
        assert!(workload_labels.get("service").is_none());
    }

    #[test]
    fn debug_reset_json_patch_skips_probes_for_init_containers() {
        let ops = build_debug_reset_json_patch(2, true);
        let ops = ops.as_array().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["path"], "/spec/template/spec/initContainers/2/args");
    }

    #[test]
    fn debug_reset_json_patch_nulls_probes_for_normal_containers() {
        let ops = build_debug_reset_json_patch(0, false);
        let ops = ops.as_array().unwrap();
        assert_eq!(ops.len(), 4);
    }

    #[test]
    fn debug_patch_matches_expected_shape_for_normal_container() {
        use k8s_openapi::api::apps::v1::Deployment;

        let workload = Deployment::default();
        let session = Session {
            mode: Mode::Debug,
            ..sample_session()
        };
        let patch = build_debug_patch(&workload, &session, 0, false, &[], None).unwrap();

        assert_json_diff::assert_json_eq!(
            patch["spec"]["template"]["spec"]["containers"][0],
            json!({
                "name": "web",
                "command": ["sh", "-c", "tail -f /dev/null"],
                "args": [],
                "readinessProbe": null,
                "livenessProbe": null,
                "startupProbe": null,
            })
        );
    }
}
