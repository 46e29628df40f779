//! Usage and ClusterUsage records that block deletion of the resource they reference.

use kube::CustomResource;
use protection_core::Descriptor;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ProtectError;

pub const PROTECTION_GROUP_VERSION: &str = "protection.crossplane.io/v1beta1";
pub const USAGE_KIND: &str = "Usage";
pub const CLUSTER_USAGE_KIND: &str = "ClusterUsage";

/// Blocks deletion of a namespaced resource.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "protection.crossplane.io", version = "v1beta1", kind = "Usage", namespaced)]
pub struct UsageSpec {
    pub of: ResourceOf,
    pub reason: String,
}

/// Blocks deletion of a cluster-scoped resource.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "protection.crossplane.io", version = "v1beta1", kind = "ClusterUsage")]
pub struct ClusterUsageSpec {
    pub of: ResourceOf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOf {
    pub api_version: String,
    pub kind: String,
    pub resource_ref: ResourceRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ResourceRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A generated record; the variant follows the scope of the protected resource.
#[derive(Debug, Clone)]
pub enum UsageRecord {
    Namespaced(Usage),
    Cluster(ClusterUsage),
}

impl UsageRecord {
    /// Build the record protecting `target`. An empty namespace means cluster scope.
    pub fn for_target(target: &Descriptor, reason: &str) -> Self {
        let name = format!("{}-function-protection", target.name());
        let of = |namespace: Option<&str>| ResourceOf {
            api_version: target.api_version().to_string(),
            kind: target.kind().to_string(),
            resource_ref: ResourceRef { name: target.name().to_string(), namespace: namespace.map(str::to_string) },
        };
        match target.namespace() {
            Some(ns) => Self::Namespaced(Usage::new(&name, UsageSpec { of: of(Some(ns)), reason: reason.to_string() })),
            None => Self::Cluster(ClusterUsage::new(&name, ClusterUsageSpec { of: of(None), reason: reason.to_string() })),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespaced(_) => USAGE_KIND,
            Self::Cluster(_) => CLUSTER_USAGE_KIND,
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Self::Namespaced(u) => &u.metadata,
            Self::Cluster(u) => &u.metadata,
        };
        meta.name.as_deref().unwrap_or("")
    }

    /// Convert into the descriptor form carried in the desired set.
    pub fn to_descriptor(&self) -> Result<Descriptor, ProtectError> {
        let raw = match self {
            Self::Namespaced(u) => serde_json::to_value(u),
            Self::Cluster(u) => serde_json::to_value(u),
        }
        .map_err(|e| ProtectError::Convert { name: self.name().to_string(), reason: e.to_string() })?;
        Descriptor::from_value(self.name(), raw)
            .map_err(|e| ProtectError::Convert { name: self.name().to_string(), reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use serde_json::json;

    fn target(ns: Option<&str>) -> Descriptor {
        let mut meta = json!({ "name": "inst-1", "uid": "6f1c" });
        if let Some(ns) = ns { meta["namespace"] = json!(ns); }
        Descriptor::from_value("m1", json!({
            "apiVersion": "rds.aws.upbound.io/v1beta1",
            "kind": "Instance",
            "metadata": meta,
            "status": { "atProvider": { "arn": "arn:aws:rds:1" } }
        }))
        .unwrap()
    }

    #[test]
    fn crd_identity_matches_constants() {
        assert_eq!(Usage::api_version(&()), PROTECTION_GROUP_VERSION);
        assert_eq!(ClusterUsage::api_version(&()), PROTECTION_GROUP_VERSION);
        assert_eq!(Usage::kind(&()), USAGE_KIND);
        assert_eq!(ClusterUsage::kind(&()), CLUSTER_USAGE_KIND);
    }

    #[test]
    fn namespaced_target_gets_usage() {
        let rec = UsageRecord::for_target(&target(Some("ns1")), "because");
        assert_eq!(rec.kind(), USAGE_KIND);
        assert_eq!(rec.name(), "inst-1-function-protection");
        assert_eq!(rec.to_descriptor().unwrap().raw(), &json!({
            "apiVersion": "protection.crossplane.io/v1beta1",
            "kind": "Usage",
            "metadata": { "name": "inst-1-function-protection" },
            "spec": {
                "of": {
                    "apiVersion": "rds.aws.upbound.io/v1beta1",
                    "kind": "Instance",
                    "resourceRef": { "name": "inst-1", "namespace": "ns1" }
                },
                "reason": "because"
            }
        }));
    }

    #[test]
    fn cluster_scoped_target_gets_cluster_usage() {
        for ns in [None, Some("")] {
            let d = UsageRecord::for_target(&target(ns), "because").to_descriptor().unwrap();
            assert_eq!(d.kind(), CLUSTER_USAGE_KIND);
            assert_eq!(d.raw()["spec"]["of"]["resourceRef"], json!({ "name": "inst-1" }));
            assert!(d.namespace().is_none());
        }
    }
}
