use crate::k8s::patch::{pvc_name, SECRET_AUTHORIZED_KEYS_KEY, SECRET_NAME};
use crate::session::types::WorkloadKind;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

/// Builds the `remote-development` Secret carrying the public key as
/// `authorized_keys`, labeled `active=true`/`service=<workload>` per
/// spec.md §3. Applied with server-side apply so repeated bring-ups are
/// idempotent upserts rather than create-or-fail.
///
/// Grounded on `pkg/remote/k8s.go`'s `getSecret`.
pub fn build_authorized_keys_secret(
    namespace: &str,
    workload_name: &str,
    public_key: &[u8],
) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert("active".to_string(), "true".to_string());
    labels.insert("service".to_string(), workload_name.to_string());

    let mut data = BTreeMap::new();
    data.insert(
        SECRET_AUTHORIZED_KEYS_KEY.to_string(),
        ByteString(public_key.to_vec()),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Builds the per-workload remote-dev PVC: `RWO`, `5Gi` requested, labeled
/// `active=true`. Created on remote-dev bring-up, deleted on teardown;
/// debug mode never calls this.
///
/// Grounded on `pkg/remote/k8s.go`'s `getPVC`; spec.md §3 resolves the
/// `2Gi`/`5Gi` discrepancy between the Go source and itself in favor of
/// `5Gi` (see DESIGN.md).
pub fn build_work_pvc(namespace: &str, kind: WorkloadKind, workload_name: &str) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::new();
    labels.insert("active".to_string(), "true".to_string());

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity("5Gi".to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(kind, workload_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_carries_authorized_keys_bytes_verbatim() {
        let secret = build_authorized_keys_secret("team-a", "api", b"ssh-rsa AAAA... user@host");
        let data = secret.data.unwrap();
        assert_eq!(
            data.get(SECRET_AUTHORIZED_KEYS_KEY).unwrap().0,
            b"ssh-rsa AAAA... user@host"
        );
        assert_eq!(secret.metadata.name.as_deref(), Some(SECRET_NAME));
    }

    #[test]
    fn pvc_requests_five_gi_rwo() {
        let pvc = build_work_pvc("team-a", WorkloadKind::Deployment, "api");
        assert_eq!(pvc.metadata.name.as_deref(), Some("deployment-api-remote-dev"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce".to_string()]);
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "5Gi");
    }
}
