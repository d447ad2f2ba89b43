use crate::errors::{PodwireError, Result};
use crate::session::types::WorkloadKind;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Capability shared by Deployment, StatefulSet and DaemonSet: name,
/// namespace, annotations, labels, pod template, selector. Modeled as a
/// trait plus dispatch tables rather than deep inheritance, per spec.md's
/// Design Notes. Grounded on the teacher's `Rollout` trait in `rollout.rs`.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn annotations_map(&self) -> BTreeMap<String, String>;
    fn labels_map(&self) -> BTreeMap<String, String>;
    fn selector_match_labels(&self) -> Result<BTreeMap<String, String>>;
    fn pod_spec(&self) -> Option<&PodSpec>;

    fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    fn containers(&self) -> Vec<Container> {
        self.pod_spec()
            .map(|spec| spec.containers.clone())
            .unwrap_or_default()
    }

    fn init_containers(&self) -> Vec<Container> {
        self.pod_spec()
            .and_then(|spec| spec.init_containers.clone())
            .unwrap_or_default()
    }

    /// Index and init-ness of the named container, searching containers then
    /// init containers (debug mode may target either).
    fn container_index(&self, name: &str) -> Result<(usize, bool)> {
        if let Some(idx) = self.containers().iter().position(|c| c.name == name) {
            return Ok((idx, false));
        }
        if let Some(idx) = self.init_containers().iter().position(|c| c.name == name) {
            return Ok((idx, true));
        }
        Err(PodwireError::ContainerNotFound(name.to_string()))
    }
}

fn match_labels_of(selector: &LabelSelector) -> BTreeMap<String, String> {
    selector.match_labels.clone().unwrap_or_default()
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn annotations_map(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    fn labels_map(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    fn selector_match_labels(&self) -> Result<BTreeMap<String, String>> {
        let spec = self.spec.as_ref().ok_or(PodwireError::NoResourceSelected)?;
        Ok(match_labels_of(&spec.selector))
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn annotations_map(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    fn labels_map(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    fn selector_match_labels(&self) -> Result<BTreeMap<String, String>> {
        let spec = self.spec.as_ref().ok_or(PodwireError::NoResourceSelected)?;
        Ok(match_labels_of(&spec.selector))
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn annotations_map(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    fn labels_map(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    fn selector_match_labels(&self) -> Result<BTreeMap<String, String>> {
        let spec = self.spec.as_ref().ok_or(PodwireError::NoResourceSelected)?;
        Ok(match_labels_of(&spec.selector))
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}
