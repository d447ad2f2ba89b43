use crate::errors::{PodwireError, Result};
use anyhow::Context;
use crate::k8s::client::K8sClient;
use crate::k8s::patch::{
    build_debug_patch, build_debug_reset_json_patch, build_remote_dev_patch, json_patch,
    pvc_name, strategic_merge_patch,
};
use crate::k8s::resources::{build_authorized_keys_secret, build_work_pvc};
use crate::k8s::snapshot::{restore_from_snapshot, snapshot_string};
use crate::k8s::workload::Workload;
use crate::keys::{self, KeyPaths};
use crate::session::markers::{read_active_marker, read_rollback_manifest, ActiveMarker};
use crate::session::types::{Mode, Session};
use crate::ssh_config;
use crate::sync_engine;
use crate::tunnel::portforward::{self, PrimaryForward};
use crate::tunnel::ssh_tunnel::{self, SshHandle, SshTunnel};
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// The state machine bring-up traverses, per spec.md §4.4. Tracked on the
/// coordinator mainly so failures can be logged with the stage they
/// occurred in and so `teardown` knows how much to unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStage {
    Fresh,
    PreflightOk,
    KeysReady,
    SyncEngineReady,
    SecretsApplied,
    PvcApplied,
    WorkloadPatched,
    PodReady,
    SshReady,
    TunnelsUp,
    SyncRunning,
    Running,
}

/// Outcome of the preflight exclusivity check (spec.md §4.4's table),
/// modeled as a pure function so it's testable without a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightOutcome {
    /// No conflicting session, or a force-recreate: issue the patch.
    Patch,
    /// Same mode, same container, no force: reuse the existing session.
    Reuse,
}

/// Grounded on spec.md §4.4's preflight table. `incoming_container` is the
/// container the new session targets; `force` is `--force-recreate`.
pub fn evaluate_preflight(
    marker: Option<&ActiveMarker>,
    incoming_mode: Mode,
    incoming_container: &str,
    force: bool,
) -> Result<PreflightOutcome> {
    let Some(marker) = marker else {
        return Ok(PreflightOutcome::Patch);
    };

    if marker.mode != incoming_mode {
        return Err(PodwireError::CrossModeConflict(marker.mode.label()));
    }

    if marker.container == incoming_container {
        return Ok(if force {
            PreflightOutcome::Patch
        } else {
            PreflightOutcome::Reuse
        });
    }

    if force {
        Ok(PreflightOutcome::Patch)
    } else {
        Err(PodwireError::InUse(marker.container.clone()))
    }
}

/// Everything bring-up accumulates that teardown needs to unwind, kept
/// generic over the workload kind so the coordinator never needs a trait
/// object for `Deployment`/`StatefulSet`/`DaemonSet`.
pub struct RunningSession {
    pub client: K8sClient,
    pub session: Session,
    pub stage: BringUpStage,
    pub rollback_manifest: Option<String>,
    pub primary_forward: Option<PrimaryForward>,
    pub ssh_handle: Option<Arc<SshHandle>>,
    pub tunnels: Vec<SshTunnel>,
    pub ssh_hostname: Option<String>,
}

impl RunningSession {
    fn fresh(client: K8sClient, session: Session) -> Self {
        RunningSession {
            client,
            session,
            stage: BringUpStage::Fresh,
            rollback_manifest: None,
            primary_forward: None,
            ssh_handle: None,
            tunnels: Vec::new(),
            ssh_hostname: None,
        }
    }
}

fn label_selector_string(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pod readiness predicate from spec.md §4.4: phase/deletion/container
/// status criteria differ depending on whether the target is an init
/// container.
fn pod_is_ready(pod: &Pod, container_name: &str, is_init: bool) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    let phase = status.phase.as_deref().unwrap_or("");

    if is_init {
        if phase != "Pending" {
            return false;
        }
        status
            .init_container_statuses
            .as_ref()
            .into_iter()
            .flatten()
            .any(|cs| cs.name == container_name && cs.started.unwrap_or(false))
    } else {
        if phase != "Running" {
            return false;
        }
        status
            .container_statuses
            .as_ref()
            .into_iter()
            .flatten()
            .any(|cs| cs.name == container_name && cs.ready)
    }
}

/// Polls pods matching the workload's label selector every 1s up to
/// `wait_timeout_sec`, per spec.md §4.4.
pub async fn wait_for_pod_ready(
    client: &K8sClient,
    namespace: &str,
    selector: &std::collections::BTreeMap<String, String>,
    container_name: &str,
    is_init: bool,
    wait_timeout_sec: u64,
) -> Result<Pod> {
    let selector_str = label_selector_string(selector);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_timeout_sec);

    loop {
        let pods = client.list_pods(namespace, &selector_str).await?;
        if let Some(pod) = pods.iter().find(|p| pod_is_ready(p, container_name, is_init)) {
            return Ok(pod.clone());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(PodwireError::PodNotReady);
        }
        sleep(Duration::from_secs(1)).await;
    }
}

/// Bring-up for remote-dev mode: full state machine through
/// `SyncRunning`/`Running`. Generic over the workload kind; callers pick
/// `W` from the CLI's `--deployment`/`--statefulset`/`--daemonset` flag.
pub async fn bring_up_remote_dev<W: Workload>(
    client: K8sClient,
    mut session: Session,
    foreground_terminal: bool,
) -> Result<RunningSession> {
    let workload: W = client.get_workload(&session.namespace, &session.workload.name).await?;

    let marker = read_active_marker(&workload);
    let outcome = evaluate_preflight(
        marker.as_ref(),
        session.mode,
        &session.container.name,
        session.force_recreate,
    )?;
    let (container_index, is_init) = workload.container_index(&session.container.name)?;
    if is_init {
        return Err(PodwireError::ContainerNotFound(session.container.name.clone()));
    }
    session.container.is_init = is_init;
    session.container.image = workload.containers()[container_index]
        .image
        .clone()
        .unwrap_or_default();

    let mut running = RunningSession::fresh(client.clone(), session.clone());
    running.stage = BringUpStage::PreflightOk;
    info!(workload = %session.workload.name, mode = %session.mode, "preflight ok");

    let key_paths = keys::ensure_keys().context("failed to provision SSH keypair")?;
    running.stage = BringUpStage::KeysReady;

    sync_engine::ensure_binary().await?;
    running.stage = BringUpStage::SyncEngineReady;

    let public_key = std::fs::read(&key_paths.public)
        .with_context(|| format!("failed to read public key at {}", key_paths.public.display()))?;
    let secret = build_authorized_keys_secret(&session.namespace, &session.workload.name, &public_key);
    client.apply_secret(&session.namespace, &secret).await?;
    running.stage = BringUpStage::SecretsApplied;

    let pvc = build_work_pvc(&session.namespace, W::KIND, &session.workload.name);
    client.apply_pvc(&session.namespace, &pvc).await?;
    running.stage = BringUpStage::PvcApplied;

    match outcome {
        PreflightOutcome::Reuse => {
            running.rollback_manifest = read_rollback_manifest(&workload, session.mode);
            info!(container = %session.container.name, "reusing existing remote-dev session, skipping patch");
        }
        PreflightOutcome::Patch => {
            let existing_snapshot = read_rollback_manifest(&workload, session.mode);
            let snapshot = match existing_snapshot {
                Some(s) => s,
                None => snapshot_string(&workload).context("failed to marshal rollback snapshot")?,
            };

            let patch_value = build_remote_dev_patch(&workload, &session)?;
            let patch_value = merge_session_markers_with_rollback(patch_value, session.mode, &snapshot);
            client
                .patch_workload::<W>(&session.namespace, &session.workload.name, strategic_merge_patch(patch_value))
                .await?;
            running.rollback_manifest = Some(snapshot);
        }
    }
    running.stage = BringUpStage::WorkloadPatched;

    let selector = workload.selector_match_labels()?;
    let ready_pod = wait_for_pod_ready(
        &client,
        &session.namespace,
        &selector,
        &session.container.name,
        is_init,
        session.wait_timeout_sec,
    )
    .await?;
    running.stage = BringUpStage::PodReady;

    let pod_name = ready_pod.metadata.name.clone().unwrap_or_default();
    let forward = portforward::start_primary_forward(client.clone(), session.namespace.clone(), pod_name).await?;
    let local_port = forward.local_port();
    running.primary_forward = Some(forward);

    let ssh_host = ssh_config::host_for(&session.workload.name, &session.namespace);
    let ssh_config_path = ssh_config::default_ssh_config_path().context("failed to resolve ssh config path")?;
    ssh_config::upsert_host_entry(&ssh_config_path, &ssh_host, local_port, &key_paths.private)
        .context("failed to write ssh config host entry")?;
    running.ssh_hostname = Some(ssh_host.clone());

    let local_loopback = std::net::SocketAddr::from(([127, 0, 0, 1], local_port));
    let ssh_handle = Arc::new(
        ssh_tunnel::connect(local_loopback, &key_paths.private).await?,
    );
    running.ssh_handle = Some(ssh_handle.clone());
    running.stage = BringUpStage::SshReady;

    for mapping in session.port_mappings.clone() {
        let tunnel = ssh_tunnel::start_tunnel(ssh_handle.clone(), mapping).await?;
        running.tunnels.push(tunnel);
    }
    running.stage = BringUpStage::TunnelsUp;

    sync_engine::start(&session, &ssh_host).await?;
    running.stage = BringUpStage::SyncRunning;

    if foreground_terminal {
        info!(host = %ssh_host, "ready for interactive shell (foreground terminal not modeled in the core)");
    }

    running.stage = BringUpStage::Running;
    running.session = session;
    Ok(running)
}

/// Bring-up for debug mode: idles the target container without sync or
/// tunnels, per spec.md §1. Goes straight from `WorkloadPatched` to
/// `PodReady`/`Running`, skipping the key/sync/secret/PVC/SSH stages.
pub async fn bring_up_debug<W: Workload>(
    client: K8sClient,
    mut session: Session,
    env_overrides: Vec<(String, String)>,
    resources_override: Option<Value>,
) -> Result<RunningSession> {
    let workload: W = client.get_workload(&session.namespace, &session.workload.name).await?;

    let marker = read_active_marker(&workload);
    let outcome = evaluate_preflight(
        marker.as_ref(),
        session.mode,
        &session.container.name,
        session.force_recreate,
    )?;
    let (container_index, is_init) = workload.container_index(&session.container.name)?;
    session.container.is_init = is_init;

    let mut running = RunningSession::fresh(client.clone(), session.clone());
    running.stage = BringUpStage::PreflightOk;

    match outcome {
        PreflightOutcome::Reuse => {
            running.rollback_manifest = read_rollback_manifest(&workload, session.mode);
            info!(container = %session.container.name, "reusing existing debug session, skipping patch");
        }
        PreflightOutcome::Patch => {
            let existing_snapshot = read_rollback_manifest(&workload, session.mode);
            let snapshot = match existing_snapshot {
                Some(s) => s,
                None => snapshot_string(&workload).context("failed to marshal rollback snapshot")?,
            };

            // reset sub-step: JSON-Patch replace of args/probes first, so the
            // strategic merge below never races the controller over probe
            // fields (spec.md §4.4).
            let reset_ops = build_debug_reset_json_patch(container_index, is_init);
            client
                .patch_workload::<W>(
                    &session.namespace,
                    &session.workload.name,
                    json_patch(reset_ops)?,
                )
                .await?;

            let patch_value = build_debug_patch(
                &workload,
                &session,
                container_index,
                is_init,
                &env_overrides,
                resources_override.as_ref(),
            )?;
            let patch_value = merge_session_markers_with_rollback(patch_value, session.mode, &snapshot);
            client
                .patch_workload::<W>(&session.namespace, &session.workload.name, strategic_merge_patch(patch_value))
                .await?;
            running.rollback_manifest = Some(snapshot);
        }
    }
    running.stage = BringUpStage::WorkloadPatched;

    let selector = workload.selector_match_labels()?;
    wait_for_pod_ready(
        &client,
        &session.namespace,
        &selector,
        &session.container.name,
        is_init,
        session.wait_timeout_sec,
    )
    .await?;
    running.stage = BringUpStage::Running;
    running.session = session;
    Ok(running)
}

/// Splices the rollback-manifest annotation into an already-built
/// strategic-merge patch's `metadata.annotations`, so it's written exactly
/// once (guarded by the caller only calling this with a freshly-taken
/// snapshot, never on reuse).
fn merge_session_markers_with_rollback(mut patch: Value, mode: Mode, snapshot: &str) -> Value {
    let key = format!("{}rollback-manifest", mode.annotation_prefix());
    if let Some(annotations) = patch
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(Value::as_object_mut)
    {
        annotations.insert(key, Value::String(snapshot.to_string()));
    }
    patch
}

/// Reverse sequence of bring-up, per spec.md §4.4. Idempotent: any stage
/// that was never reached is simply skipped, so calling this twice (or on
/// a session that failed early) never errors.
pub async fn teardown<W: Workload>(mut running: RunningSession) -> Result<()> {
    let session = &running.session;
    info!(workload = %session.workload.name, mode = %session.mode, "starting teardown");

    if running.stage as u8 >= BringUpStage::SyncRunning as u8 {
        if let Err(err) = sync_engine::stop(session).await {
            warn!(%err, "failed to stop sync session, continuing teardown");
        }
    }

    for tunnel in running.tunnels.drain(..) {
        tunnel.stop().await;
    }

    if let Some(handle) = running.ssh_handle.take() {
        ssh_tunnel::disconnect(&handle).await;
    }

    if let Some(forward) = running.primary_forward.take() {
        forward.stop().await;
    }

    if session.is_remote_dev() {
        let pvc = pvc_name(W::KIND, &session.workload.name);
        if let Err(err) = running.client.delete_pvc(&session.namespace, &pvc).await {
            warn!(%err, "failed to delete remote-dev PVC, continuing teardown");
        }
    }

    if running.stage as u8 >= BringUpStage::WorkloadPatched as u8 {
        match &running.rollback_manifest {
            Some(snapshot) => {
                let workload: W = restore_from_snapshot(snapshot)
                    .context("failed to decode rollback manifest")?;
                running
                    .client
                    .update_workload::<W>(&session.namespace, &workload)
                    .await?;
            }
            None => {
                return Err(PodwireError::NoRollback);
            }
        }
    }

    if session.is_remote_dev() {
        if let Err(err) = sync_engine::shutdown().await {
            warn!(%err, "failed to stop sync daemon, continuing teardown");
        }
    }

    info!(workload = %session.workload.name, "teardown complete");
    Ok(())
}

/// Teardown entry point for `remote down`/`debug down`: a fresh process
/// with no live `RunningSession` to unwind, just a workload to restore.
/// Missing rollback manifest means the workload is already at rest — the
/// second invocation of `down` on an already-torn-down workload succeeds
/// without error (spec.md Testable Property 6).
pub async fn teardown_by_name<W: Workload>(
    client: &K8sClient,
    namespace: &str,
    name: &str,
    mode: Mode,
) -> Result<()> {
    let workload: W = client.get_workload(namespace, name).await?;

    let Some(snapshot) = read_rollback_manifest(&workload, mode) else {
        info!(namespace, name, "no active session found, nothing to tear down");
        return Ok(());
    };

    if mode == Mode::RemoteDev {
        let pvc = pvc_name(W::KIND, name);
        if let Err(err) = client.delete_pvc(namespace, &pvc).await {
            warn!(%err, "failed to delete remote-dev PVC, continuing teardown");
        }
    }

    let restored: W =
        restore_from_snapshot(&snapshot).context("failed to decode rollback manifest")?;
    client.update_workload::<W>(namespace, &restored).await?;

    if mode == Mode::RemoteDev {
        if let Err(err) = sync_engine::shutdown().await {
            warn!(%err, "failed to stop sync daemon, continuing teardown");
        }
    }

    info!(namespace, name, "teardown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(mode: Mode, container: &str) -> ActiveMarker {
        ActiveMarker {
            mode,
            container: container.to_string(),
        }
    }

    #[test]
    fn no_marker_always_patches() {
        let outcome = evaluate_preflight(None, Mode::RemoteDev, "web", false).unwrap();
        assert_eq!(outcome, PreflightOutcome::Patch);
    }

    #[test]
    fn cross_mode_conflict_remote_dev_over_debug() {
        let m = marker(Mode::Debug, "web");
        let err = evaluate_preflight(Some(&m), Mode::RemoteDev, "web", false).unwrap_err();
        assert!(matches!(err, PodwireError::CrossModeConflict(_)));
    }

    #[test]
    fn cross_mode_conflict_debug_over_remote_dev() {
        let m = marker(Mode::RemoteDev, "web");
        let err = evaluate_preflight(Some(&m), Mode::Debug, "web", false).unwrap_err();
        assert!(matches!(err, PodwireError::CrossModeConflict(_)));
    }

    #[test]
    fn same_session_same_container_no_force_reuses() {
        let m = marker(Mode::RemoteDev, "web");
        let outcome = evaluate_preflight(Some(&m), Mode::RemoteDev, "web", false).unwrap();
        assert_eq!(outcome, PreflightOutcome::Reuse);
    }

    #[test]
    fn same_session_same_container_force_repatches() {
        let m = marker(Mode::RemoteDev, "web");
        let outcome = evaluate_preflight(Some(&m), Mode::RemoteDev, "web", true).unwrap();
        assert_eq!(outcome, PreflightOutcome::Patch);
    }

    #[test]
    fn same_session_different_container_no_force_fails_in_use() {
        let m = marker(Mode::RemoteDev, "web");
        let err = evaluate_preflight(Some(&m), Mode::RemoteDev, "sidecar", false).unwrap_err();
        assert!(matches!(err, PodwireError::InUse(c) if c == "web"));
    }

    #[test]
    fn same_session_different_container_force_repatches() {
        let m = marker(Mode::RemoteDev, "web");
        let outcome = evaluate_preflight(Some(&m), Mode::RemoteDev, "sidecar", true).unwrap();
        assert_eq!(outcome, PreflightOutcome::Patch);
    }

    #[test]
    fn pod_ready_for_normal_container_requires_running_and_ready_status() {
        use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let pod = Pod {
            metadata: ObjectMeta::default(),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "web".to_string(),
                    ready: true,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(pod_is_ready(&pod, "web", false));
    }

    #[test]
    fn pod_ready_for_init_container_requires_pending_and_started_status() {
        use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let pod = Pod {
            metadata: ObjectMeta::default(),
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                init_container_statuses: Some(vec![ContainerStatus {
                    name: "init-cfg".to_string(),
                    started: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(pod_is_ready(&pod, "init-cfg", true));
    }

    #[test]
    fn pod_with_deletion_timestamp_is_never_ready() {
        use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

        let pod = Pod {
            metadata: ObjectMeta {
                deletion_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "web".to_string(),
                    ready: true,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!pod_is_ready(&pod, "web", false));
    }
}
