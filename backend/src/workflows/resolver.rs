// Workflow Resolver - picks the workflow governing a lead

use leadline_shared::{
    LeadWorkflowOverride, OverrideMode, ResolutionSource, Workflow, WorkflowAssignmentRule,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::repository::{WorkflowRepository, WorkflowResult};

/// Lead attributes assignment rules match against.
#[derive(Debug, Clone, Default)]
pub struct ResolveInput {
    pub lead_source: Option<String>,
    pub lead_service_type: Option<String>,
    pub pipeline_stage: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub workflow: Option<Workflow>,
    pub source: ResolutionSource,
    pub override_mode: Option<OverrideMode>,
    pub matched_rule_id: Option<Uuid>,
}

impl Resolution {
    fn none(source: ResolutionSource, override_mode: Option<OverrideMode>) -> Self {
        Self {
            workflow: None,
            source,
            override_mode,
            matched_rule_id: None,
        }
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

/// An empty rule field is a wildcard; a populated one must equal the input.
fn field_matches(rule_value: Option<&str>, input: Option<&str>) -> bool {
    match normalize(rule_value) {
        None => true,
        Some(expected) => normalize(input).is_some_and(|actual| actual == expected),
    }
}

fn rule_matches(rule: &WorkflowAssignmentRule, input: &ResolveInput) -> bool {
    field_matches(rule.lead_source.as_deref(), input.lead_source.as_deref())
        && field_matches(rule.lead_service_type.as_deref(), input.lead_service_type.as_deref())
        && field_matches(rule.pipeline_stage.as_deref(), input.pipeline_stage.as_deref())
}

/// Resolution over already-loaded data. `workflows` holds only enabled
/// workflows; anything absent is treated as disabled.
pub fn resolve_from(
    workflows: &[Workflow],
    rules: &[WorkflowAssignmentRule],
    lead_override: Option<&LeadWorkflowOverride>,
    input: &ResolveInput,
) -> Resolution {
    let by_id: HashMap<Uuid, &Workflow> = workflows
        .iter()
        .filter(|w| w.enabled)
        .map(|w| (w.id, w))
        .collect();

    if let Some(lead_override) = lead_override {
        return match lead_override.mode {
            OverrideMode::Clear => Resolution::none(ResolutionSource::ManualClear, Some(OverrideMode::Clear)),
            OverrideMode::Manual => Resolution {
                workflow: lead_override
                    .workflow_id
                    .and_then(|id| by_id.get(&id))
                    .map(|w| (*w).clone()),
                source: ResolutionSource::ManualOverride,
                override_mode: Some(OverrideMode::Manual),
                matched_rule_id: None,
            },
        };
    }

    let mut ordered: Vec<&WorkflowAssignmentRule> = rules.iter().filter(|r| r.enabled).collect();
    // Stable: equal priorities keep their loaded order.
    ordered.sort_by_key(|r| r.priority);

    for rule in ordered {
        if !rule_matches(rule, input) {
            continue;
        }
        if let Some(workflow) = by_id.get(&rule.workflow_id) {
            return Resolution {
                workflow: Some((*workflow).clone()),
                source: ResolutionSource::AutoRule,
                override_mode: None,
                matched_rule_id: Some(rule.id),
            };
        }
    }

    Resolution::none(ResolutionSource::OrganizationDefault, None)
}

/// The tenant's fallback workflow: key `default`, else the earliest created.
pub fn default_workflow(workflows: &[Workflow]) -> Option<&Workflow> {
    let enabled = workflows.iter().filter(|w| w.enabled);
    enabled
        .clone()
        .find(|w| w.key.trim().eq_ignore_ascii_case("default"))
        .or_else(|| enabled.min_by_key(|w| w.created_at))
}

#[derive(Clone)]
pub struct WorkflowResolver {
    repository: Arc<dyn WorkflowRepository>,
}

impl WorkflowResolver {
    pub fn new(repository: Arc<dyn WorkflowRepository>) -> Self {
        Self { repository }
    }

    pub async fn resolve(&self, tenant_id: Uuid, lead_id: Uuid, input: &ResolveInput) -> WorkflowResult<Resolution> {
        let workflows = self.repository.list_enabled_workflows(tenant_id).await?;
        self.resolve_with(&workflows, tenant_id, lead_id, input).await
    }

    async fn resolve_with(
        &self,
        workflows: &[Workflow],
        tenant_id: Uuid,
        lead_id: Uuid,
        input: &ResolveInput,
    ) -> WorkflowResult<Resolution> {
        let lead_override = self.repository.get_override(tenant_id, lead_id).await?;

        // Rules are irrelevant once an override exists.
        let rules = match lead_override {
            Some(_) => Vec::new(),
            None => self.repository.list_rules(tenant_id).await?,
        };

        let resolution = resolve_from(workflows, &rules, lead_override.as_ref(), input);
        debug!(
            %tenant_id,
            %lead_id,
            source = %resolution.source,
            workflow_id = ?resolution.workflow.as_ref().map(|w| w.id),
            "Resolved workflow"
        );
        Ok(resolution)
    }

    /// Like `resolve`, but an `organization_default` outcome is filled with
    /// the tenant's default workflow.
    pub async fn resolve_effective(
        &self,
        tenant_id: Uuid,
        lead_id: Uuid,
        input: &ResolveInput,
    ) -> WorkflowResult<Resolution> {
        let workflows = self.repository.list_enabled_workflows(tenant_id).await?;
        let mut resolution = self.resolve_with(&workflows, tenant_id, lead_id, input).await?;
        if resolution.source == ResolutionSource::OrganizationDefault && resolution.workflow.is_none() {
            resolution.workflow = default_workflow(&workflows).cloned();
        }
        Ok(resolution)
    }
}
