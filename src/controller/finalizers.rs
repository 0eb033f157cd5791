//! Finalizer bookkeeping
//!
//! Modules and NodeModulesConfigs use the kube-rs `finalizer` helper. Worker
//! pods carry a finalizer the worker loop strips by hand once the pod's
//! outcome has been recorded, or when the node's state is torn down.

use std::fmt::Debug;

use kube::{
    api::{Api, Patch, PatchParams},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;

use crate::constants::FIELD_MANAGER;
use crate::error::Result;

pub use crate::constants::{MODULE_FINALIZER, NMC_FINALIZER, WORKER_POD_FINALIZER};

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Merge patch dropping `finalizer`, or `None` when it is not present.
///
/// The patch pins the object's resourceVersion so a concurrent writer makes
/// it fail with a conflict instead of being overwritten.
pub fn finalizer_removal_patch<K: Resource>(obj: &K, finalizer: &str) -> Option<Value> {
    if !has_finalizer(obj, finalizer) {
        return None;
    }

    let remaining: Vec<&String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .collect();

    Some(json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": remaining
        }
    }))
}

/// Remove `finalizer` from `obj`; a no-op when it is already gone
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(patch) = finalizer_removal_patch(obj, finalizer) else {
        return Ok(());
    };

    match api
        .patch(
            &obj.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => {
            info!("Removed finalizer {} from {}", finalizer, obj.name_any());
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn pod_with_finalizers(finalizers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("kmm-worker-node1-mod".to_string()),
                resource_version: Some("42".to_string()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_finalizer_names() {
        assert_eq!(
            WORKER_POD_FINALIZER,
            "kmm.node.kubernetes.io/nodemodulesconfig-reconciler"
        );
        assert!(MODULE_FINALIZER.starts_with("kmm.node.kubernetes.io/"));
        assert!(NMC_FINALIZER.starts_with("kmm.node.kubernetes.io/"));
    }

    #[test]
    fn removal_patch_keeps_other_finalizers() {
        let pod = pod_with_finalizers(&[WORKER_POD_FINALIZER, "other/finalizer"]);

        let patch = finalizer_removal_patch(&pod, WORKER_POD_FINALIZER).unwrap();

        assert_eq!(patch["metadata"]["finalizers"], json!(["other/finalizer"]));
        assert_eq!(patch["metadata"]["resourceVersion"], json!("42"));
    }

    #[test]
    fn removal_patch_absent_when_finalizer_missing() {
        let pod = pod_with_finalizers(&["other/finalizer"]);
        assert!(!has_finalizer(&pod, WORKER_POD_FINALIZER));
        assert!(finalizer_removal_patch(&pod, WORKER_POD_FINALIZER).is_none());
    }
}
