//! Deletion protection function.
//!
//! Every composed resource labelled `protection.fn.crossplane.io/block-deletion: "true"`
//! (on the desired or the observed copy) gets a Usage record that blocks its
//! deletion. The composite is protected too whenever it carries the label itself
//! or any of its members is protected, since deleting it would cascade.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use protection_core::{
    Descriptor, DesiredResource, DesiredSet, EnvelopeError, FunctionRunner, Name, ObservedSet,
    RunFunctionRequest, RunFunctionResponse,
};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod usage;

pub use config::FunctionConfig;
pub use usage::{ClusterUsage, ResourceOf, ResourceRef, Usage, UsageRecord};

pub const PROTECTION_LABEL_BLOCK_DELETION: &str = "protection.fn.crossplane.io/block-deletion";
/// Opt-in gate, consulted only with [`FunctionConfig::require_enabled_label`].
pub const PROTECTION_LABEL_ENABLED: &str = "protection.fn.crossplane.io/enabled";

pub const CONDITION_FUNCTION_SUCCESS: &str = "FunctionSuccess";
const REASON_SUCCESS: &str = "Success";

#[derive(Debug, thiserror::Error)]
pub enum ProtectError {
    #[error("cannot get primary resource: {0}")]
    Primary(EnvelopeError),
    #[error("cannot get observed members: {0}")]
    Observed(EnvelopeError),
    #[error("cannot get desired members: {0}")]
    Desired(EnvelopeError),
    #[error("cannot convert usage record {name}: {reason}")]
    Convert { name: String, reason: String },
    #[error("cannot set desired members: {0}")]
    SetDesired(EnvelopeError),
}

/// True when `key` is set to "true" in any letter case.
pub fn label_is_true(resource: &Descriptor, key: &str) -> bool {
    resource.label(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

pub fn member_usage_key(protected_name: &str) -> Name {
    format!("{}-protection", protected_name)
}

pub fn composite_usage_key(composite_name: &str) -> Name {
    format!("{}-xr-protection", composite_name)
}

fn member_reason() -> String {
    format!("Created by function-deletion-protection via label {}", PROTECTION_LABEL_BLOCK_DELETION)
}

fn composite_reason() -> String {
    format!("deletion blocked by function-deletion-protection via label {}", PROTECTION_LABEL_BLOCK_DELETION)
}

/// Outcome of one protection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Member names found protected, in desired-set order.
    pub protected: Vec<Name>,
    pub composite_protected: bool,
    /// Usage keys inserted into the desired set.
    pub added: Vec<Name>,
    /// Usage keys already taken by a different desired resource; left untouched.
    pub collisions: Vec<Name>,
}

/// Add Usage records for protected members and, if needed, the composite.
///
/// Only members present in both `desired` and `observed` are eligible, and the
/// record always references the observed copy. Existing desired entries are
/// never replaced.
pub fn protect(primary: &Descriptor, observed: &ObservedSet, desired: &mut DesiredSet) -> Result<Decision, ProtectError> {
    let mut decision = Decision::default();
    let mut pending: Vec<(Name, Descriptor)> = Vec::new();

    for (name, want) in desired.iter() {
        let Some(live) = observed.get(name) else { continue };
        if !label_is_true(&want.resource, PROTECTION_LABEL_BLOCK_DELETION)
            && !label_is_true(live, PROTECTION_LABEL_BLOCK_DELETION)
        {
            continue;
        }
        debug!(name = %name, "protecting desired resource");
        let usage = UsageRecord::for_target(live, &member_reason());
        let key = member_usage_key(live.name());
        debug!(usage = %key, kind = usage.kind(), "creating usage");
        pending.push((key, usage.to_descriptor()?));
        decision.protected.push(name.clone());
    }
    for (key, usage) in pending {
        insert_usage(desired, key, usage, &mut decision);
    }

    if label_is_true(primary, PROTECTION_LABEL_BLOCK_DELETION) || !decision.protected.is_empty() {
        debug!(name = %primary.name(), "protecting composite");
        let usage = UsageRecord::for_target(primary, &composite_reason()).to_descriptor()?;
        insert_usage(desired, composite_usage_key(primary.name()), usage, &mut decision);
        decision.composite_protected = true;
    }
    Ok(decision)
}

fn insert_usage(desired: &mut DesiredSet, key: Name, usage: Descriptor, decision: &mut Decision) {
    match desired.get(&key) {
        Some(existing) if existing.resource == usage => {}
        Some(_) => {
            warn!(key = %key, "desired resource already exists; usage not added");
            decision.collisions.push(key);
        }
        None => {
            desired.insert(key.clone(), DesiredResource::new(usage));
            decision.added.push(key);
        }
    }
}

/// The function handler.
#[derive(Debug, Clone, Default)]
pub struct DeletionProtection {
    cfg: FunctionConfig,
}

impl DeletionProtection {
    pub fn new(cfg: FunctionConfig) -> Self { Self { cfg } }

    /// Run one invocation. Errors end up as a fatal result in the response.
    pub fn run(&self, req: &RunFunctionRequest) -> RunFunctionResponse {
        let started = Instant::now();
        counter!("protection_runs", 1u64);
        info!(tag = %req.meta.tag, "running function");

        let mut rsp = RunFunctionResponse::to(req, self.cfg.response_ttl);
        match self.reconcile(req, &mut rsp) {
            Ok(decision) => {
                for key in &decision.collisions {
                    rsp.warning(format!("cannot add usage record {}: desired resource already exists", key));
                }
                counter!("protection_usages_created", decision.added.len() as u64);
                counter!("protection_collisions", decision.collisions.len() as u64);
                info!(
                    protected = decision.protected.len(),
                    composite = decision.composite_protected,
                    added = decision.added.len(),
                    "function complete"
                );
                rsp.condition_true(CONDITION_FUNCTION_SUCCESS, REASON_SUCCESS).target_composite_and_claim();
            }
            Err(e) => {
                error!(error = %e, "function failed");
                counter!("protection_fatal", 1u64);
                rsp.fatal(e.to_string());
            }
        }
        histogram!("protection_run_ms", started.elapsed().as_secs_f64() * 1000.0);
        rsp
    }

    fn reconcile(&self, req: &RunFunctionRequest, rsp: &mut RunFunctionResponse) -> Result<Decision, ProtectError> {
        let primary = req.observed_composite().map_err(ProtectError::Primary)?;
        let observed = req.observed_resources().map_err(ProtectError::Observed)?;
        let mut desired = req.desired_resources().map_err(ProtectError::Desired)?;

        if self.cfg.require_enabled_label && !label_is_true(&primary, PROTECTION_LABEL_ENABLED) {
            debug!(name = %primary.name(), "enabled label not set; skipping protection");
            return Ok(Decision::default());
        }

        let decision = protect(&primary, &observed, &mut desired)?;
        rsp.set_desired_resources(desired).map_err(ProtectError::SetDesired)?;
        Ok(decision)
    }
}

#[async_trait::async_trait]
impl FunctionRunner for DeletionProtection {
    async fn run_function(&self, req: RunFunctionRequest) -> anyhow::Result<RunFunctionResponse> {
        Ok(self.run(&req))
    }
}
