//! Wire envelope for one function invocation.
//!
//! Field names and enum spellings follow the protobuf JSON mapping used by the
//! orchestrator, so a request captured from a live pipeline can be fed in as-is.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{Descriptor, DesiredSet, Name, ObservedSet};

/// Errors raised while reading or writing the envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("observed composite resource is missing")]
    MissingComposite,
    #[error("resource {name} is not an object (found {found})")]
    NotAnObject { name: String, found: &'static str },
    #[error("desired resource name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFunctionRequest {
    #[serde(default)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub observed: State,
    #[serde(default)]
    pub desired: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Opaque tag the orchestrator uses to correlate and cache responses.
    #[serde(default)]
    pub tag: String,
}

/// Observed or desired state: the composite plus its composed members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<ResourceEnvelope>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<Name, ResourceEnvelope>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEnvelope {
    #[serde(default)]
    pub resource: Json,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connection_details: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Ready::is_unspecified")]
    pub ready: Ready,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ready {
    #[default]
    #[serde(rename = "READY_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "READY_TRUE")]
    True,
    #[serde(rename = "READY_FALSE")]
    False,
}

impl Ready {
    pub fn is_unspecified(&self) -> bool { matches!(self, Ready::Unspecified) }
}

/// A desired member: the descriptor plus its readiness as declared upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResource {
    pub resource: Descriptor,
    pub ready: Ready,
}

impl DesiredResource {
    pub fn new(resource: Descriptor) -> Self { Self { resource, ready: Ready::Unspecified } }
}

impl RunFunctionRequest {
    /// The primary resource for this invocation.
    pub fn observed_composite(&self) -> Result<Descriptor, EnvelopeError> {
        match self.observed.composite.as_ref() {
            Some(env) if !env.resource.is_null() => Descriptor::from_value("composite", env.resource.clone()),
            _ => Err(EnvelopeError::MissingComposite),
        }
    }

    pub fn observed_resources(&self) -> Result<ObservedSet, EnvelopeError> {
        self.observed
            .resources
            .iter()
            .map(|(name, env)| -> Result<_, EnvelopeError> {
                Ok((name.clone(), Descriptor::from_value(name, env.resource.clone())?))
            })
            .collect()
    }

    /// Members desired by earlier functions in the pipeline.
    pub fn desired_resources(&self) -> Result<DesiredSet, EnvelopeError> {
        self.desired
            .resources
            .iter()
            .map(|(name, env)| -> Result<_, EnvelopeError> {
                let resource = Descriptor::from_value(name, env.resource.clone())?;
                Ok((name.clone(), DesiredResource { resource, ready: env.ready }))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFunctionResponse {
    pub meta: ResponseMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<FunctionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub tag: String,
    /// Protobuf JSON duration, e.g. `"60s"`.
    pub ttl: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionResult {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "SEVERITY_FATAL")]
    Fatal,
    #[serde(rename = "SEVERITY_WARNING")]
    Warning,
    #[serde(rename = "SEVERITY_NORMAL")]
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "TARGET_COMPOSITE")]
    Composite,
    #[serde(rename = "TARGET_COMPOSITE_AND_CLAIM")]
    CompositeAndClaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[serde(rename = "STATUS_CONDITION_TRUE")]
    True,
    #[serde(rename = "STATUS_CONDITION_FALSE")]
    False,
    #[serde(rename = "STATUS_CONDITION_UNKNOWN")]
    Unknown,
}

/// Status condition the orchestrator copies onto the composite (and claim).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}

impl Condition {
    pub fn target_composite_and_claim(&mut self) -> &mut Self {
        self.target = Some(Target::CompositeAndClaim);
        self
    }
}

impl RunFunctionResponse {
    /// Start a response for `req`: tag and TTL set, desired state and context
    /// carried over so later functions see what earlier ones produced.
    pub fn to(req: &RunFunctionRequest, ttl: Duration) -> Self {
        Self {
            meta: ResponseMeta { tag: req.meta.tag.clone(), ttl: format!("{}s", ttl.as_secs_f64()) },
            desired: Some(req.desired.clone()),
            results: Vec::new(),
            context: req.context.clone(),
            conditions: Vec::new(),
        }
    }

    /// Mark the invocation failed. No desired state is returned after a fatal result.
    pub fn fatal(&mut self, message: impl Into<String>) {
        self.desired = None;
        self.results.push(FunctionResult { severity: Severity::Fatal, message: message.into(), target: None });
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.results.push(FunctionResult { severity: Severity::Warning, message: message.into(), target: None });
    }

    pub fn is_fatal(&self) -> bool {
        self.results.iter().any(|r| r.severity == Severity::Fatal)
    }

    pub fn condition_true(&mut self, kind: impl Into<String>, reason: impl Into<String>) -> &mut Condition {
        self.conditions.push(Condition {
            kind: kind.into(),
            status: ConditionStatus::True,
            reason: reason.into(),
            message: None,
            target: None,
        });
        let last = self.conditions.len() - 1;
        &mut self.conditions[last]
    }

    /// Replace the desired members. The desired composite is left as is.
    pub fn set_desired_resources(&mut self, desired: DesiredSet) -> Result<(), EnvelopeError> {
        let mut resources = BTreeMap::new();
        for (name, d) in desired {
            if name.is_empty() {
                return Err(EnvelopeError::EmptyName);
            }
            let env = ResourceEnvelope { resource: d.resource.into_raw(), connection_details: BTreeMap::new(), ready: d.ready };
            resources.insert(name, env);
        }
        self.desired.get_or_insert_with(State::default).resources = resources;
        Ok(())
    }

    pub fn desired_resource(&self, name: &str) -> Option<&Json> {
        self.desired.as_ref()?.resources.get(name).map(|env| &env.resource)
    }
}
