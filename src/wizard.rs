use crate::errors::{PodwireError, Result};
use crate::k8s::client::K8sClient;
use crate::k8s::workload::Workload;
use crate::session::types::WorkloadKind;
use dialoguer::{Input, Select};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use std::path::Path;

/// Interactive fallback for selector flags the CLI didn't get (E2), per
/// spec.md §6's supplement. Every prompt is skipped when there's exactly
/// one option, matching `original_source/pkg/util/interactive.go`'s
/// `Select` helper (it degenerates to "pick the only one" silently).
pub async fn select_namespace(client: &K8sClient) -> Result<String> {
    let namespaces = client.list_namespaces().await?;
    let mut names: Vec<String> = namespaces
        .into_iter()
        .filter_map(|ns| ns.metadata.name)
        .collect();
    names.sort();

    if names.is_empty() {
        return Err(PodwireError::NoNamespaceSelected);
    }
    if names.len() == 1 {
        return Ok(names.remove(0));
    }

    let choice = Select::new()
        .with_prompt("Select a namespace")
        .items(&names)
        .default(0)
        .interact()
        .map_err(|_| PodwireError::NoNamespaceSelected)?;
    Ok(names.remove(choice))
}

struct WorkloadChoice {
    kind: WorkloadKind,
    name: String,
}

impl std::fmt::Display for WorkloadChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Lists Deployments, StatefulSets and DaemonSets in the namespace together
/// and lets the user pick one, when no `--deployment`/`--statefulset`/
/// `--daemonset` flag narrowed it down already.
pub async fn select_workload(client: &K8sClient, namespace: &str) -> Result<(WorkloadKind, String)> {
    let mut choices = Vec::new();
    for d in client.list_workloads::<Deployment>(namespace).await? {
        choices.push(WorkloadChoice {
            kind: WorkloadKind::Deployment,
            name: d.name(),
        });
    }
    for s in client.list_workloads::<StatefulSet>(namespace).await? {
        choices.push(WorkloadChoice {
            kind: WorkloadKind::StatefulSet,
            name: s.name(),
        });
    }
    for d in client.list_workloads::<DaemonSet>(namespace).await? {
        choices.push(WorkloadChoice {
            kind: WorkloadKind::DaemonSet,
            name: d.name(),
        });
    }

    if choices.is_empty() {
        return Err(PodwireError::NoResources);
    }
    if choices.len() == 1 {
        let only = choices.remove(0);
        return Ok((only.kind, only.name));
    }

    let labels: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
    let choice = Select::new()
        .with_prompt("Select a workload")
        .items(&labels)
        .default(0)
        .interact()
        .map_err(|_| PodwireError::NoResourceSelected)?;
    let picked = choices.remove(choice);
    Ok((picked.kind, picked.name))
}

/// Lists a workload's containers (normal then init) and lets the user pick
/// the target.
pub fn select_container<W: Workload>(workload: &W) -> Result<(String, bool)> {
    let mut names: Vec<(String, bool)> = workload
        .containers()
        .into_iter()
        .map(|c| (c.name, false))
        .collect();
    names.extend(workload.init_containers().into_iter().map(|c| (c.name, true)));

    if names.is_empty() {
        return Err(PodwireError::NoContainers);
    }
    if names.len() == 1 {
        return Ok(names.remove(0));
    }

    let labels: Vec<String> = names
        .iter()
        .map(|(n, is_init)| if *is_init { format!("{n} (init)") } else { n.clone() })
        .collect();
    let choice = Select::new()
        .with_prompt("Select a container")
        .items(&labels)
        .default(0)
        .interact()
        .map_err(|_| PodwireError::NoContainers)?;
    Ok(names.remove(choice))
}

/// Prompts for a local sync path with existence validation, grounded on
/// `original_source/pkg/remote/interactive.go`'s path prompt.
pub fn prompt_local_sync_path() -> Result<String> {
    let input: String = Input::new()
        .with_prompt("Local sync path")
        .validate_with(|value: &String| -> std::result::Result<(), String> {
            if Path::new(value).exists() {
                Ok(())
            } else {
                Err(format!("path {value:?} does not exist"))
            }
        })
        .interact_text()
        .map_err(|_| PodwireError::NoResourceSelected)?;
    Ok(input)
}

/// Prompts for the remote sync path (no local existence check — it's a
/// path inside the container's image).
pub fn prompt_remote_sync_path() -> Result<String> {
    let input: String = Input::new()
        .with_prompt("Remote sync path")
        .interact_text()
        .map_err(|_| PodwireError::NoResourceSelected)?;
    Ok(input)
}
