//! Protection core: resource descriptors and the function wire envelope.
//!
//! Descriptors are kept as raw JSON objects. Only the identity fields and labels
//! are read through typed accessors; everything else rides along untouched.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value as Json;

pub mod envelope;

pub use envelope::{
    Condition, ConditionStatus, DesiredResource, EnvelopeError, FunctionResult, Ready, RequestMeta,
    ResourceEnvelope, ResponseMeta, RunFunctionRequest, RunFunctionResponse, Severity, State,
    Target,
};

/// Pipeline-local name of a member resource (the map key, not `metadata.name`).
pub type Name = String;

/// Observed members keyed by member name. Ordered so responses are stable.
pub type ObservedSet = BTreeMap<Name, Descriptor>;

/// Desired members keyed by member name.
pub type DesiredSet = BTreeMap<Name, DesiredResource>;

/// A Kubernetes-style object held as a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Descriptor {
    raw: Json,
}

impl Descriptor {
    /// Wrap a JSON value. Anything other than an object is rejected.
    pub fn from_value(name: &str, raw: Json) -> Result<Self, EnvelopeError> {
        if raw.is_object() {
            Ok(Self { raw })
        } else {
            Err(EnvelopeError::NotAnObject { name: name.to_string(), found: json_type(&raw) })
        }
    }

    pub fn raw(&self) -> &Json { &self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    pub fn api_version(&self) -> &str {
        self.raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.meta_str("name").unwrap_or("")
    }

    /// Namespace, with an empty string treated the same as no namespace.
    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace").filter(|ns| !ns.is_empty())
    }

    /// Value of a single label. Missing or non-string labels read as `None`.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .and_then(|l| l.get(key))
            .and_then(|v| v.as_str())
    }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
    }
}

fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Transport-agnostic function surface. A gRPC server, a CLI or a test harness
/// drives the same implementation through this trait.
#[async_trait::async_trait]
pub trait FunctionRunner: Send + Sync {
    /// Handle one invocation. Failures of the function itself are reported as
    /// fatal results inside the response; `Err` is reserved for the host.
    async fn run_function(&self, req: RunFunctionRequest) -> anyhow::Result<RunFunctionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors_read_identity_fields() {
        let d = Descriptor::from_value("m1", json!({
            "apiVersion": "rds.aws.upbound.io/v1beta1",
            "kind": "Instance",
            "metadata": { "name": "inst-1", "namespace": "ns1", "labels": { "team": "db" } },
            "spec": { "forProvider": { "region": "us-east-1" } }
        }))
        .unwrap();
        assert_eq!(d.api_version(), "rds.aws.upbound.io/v1beta1");
        assert_eq!(d.kind(), "Instance");
        assert_eq!(d.name(), "inst-1");
        assert_eq!(d.namespace(), Some("ns1"));
        assert_eq!(d.label("team"), Some("db"));
        assert_eq!(d.label("absent"), None);
    }

    #[test]
    fn malformed_fields_read_as_absent() {
        let d = Descriptor::from_value("x", json!({
            "kind": 7,
            "metadata": { "namespace": "", "labels": ["not", "a", "map"] }
        }))
        .unwrap();
        assert_eq!(d.api_version(), "");
        assert_eq!(d.kind(), "");
        assert_eq!(d.name(), "");
        assert_eq!(d.namespace(), None);
        assert_eq!(d.label("anything"), None);

        let d = Descriptor::from_value("y", json!({ "metadata": { "labels": { "k": true } } })).unwrap();
        assert_eq!(d.label("k"), None);
    }

    #[test]
    fn non_objects_are_rejected() {
        let err = Descriptor::from_value("bad", json!("oops")).unwrap_err();
        assert_eq!(err.to_string(), "resource bad is not an object (found string)");
    }
}
