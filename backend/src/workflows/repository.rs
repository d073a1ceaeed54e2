// Workflow Configuration Store - read side used by resolution, plus override lifecycle

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadline_shared::{
    LeadWorkflowOverride, OverrideMode, RecipientConfig, Workflow, WorkflowAssignmentRule, WorkflowStep,
};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt workflow data: {0}")]
    Corrupt(String),
    #[error("Invalid override: {0}")]
    InvalidOverride(String),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Enabled workflows of the tenant with their steps in presentation order.
    async fn list_enabled_workflows(&self, tenant_id: Uuid) -> WorkflowResult<Vec<Workflow>>;

    /// Every assignment rule of the tenant, ordered by priority then creation.
    async fn list_rules(&self, tenant_id: Uuid) -> WorkflowResult<Vec<WorkflowAssignmentRule>>;

    async fn get_override(&self, tenant_id: Uuid, lead_id: Uuid) -> WorkflowResult<Option<LeadWorkflowOverride>>;

    async fn upsert_override(&self, record: LeadWorkflowOverride) -> WorkflowResult<()>;

    async fn delete_override(&self, tenant_id: Uuid, lead_id: Uuid) -> WorkflowResult<bool>;
}

fn check_override(record: &LeadWorkflowOverride) -> WorkflowResult<()> {
    match (record.mode, record.workflow_id) {
        (OverrideMode::Manual, None) => Err(WorkflowError::InvalidOverride(
            "manual override requires a workflow".to_string(),
        )),
        _ => Ok(()),
    }
}

// ===== PostgreSQL =====

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    tenant_id: Uuid,
    key: String,
    name: String,
    enabled: bool,
    quote_valid_days_override: Option<i32>,
    quote_payment_days_override: Option<i32>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct StepRow {
    id: Uuid,
    workflow_id: Uuid,
    step_order: i32,
    trigger: String,
    channel: String,
    audience: String,
    recipient_config: serde_json::Value,
    template_subject: Option<String>,
    template_body: String,
    delay_minutes: i32,
    enabled: bool,
    stop_on_reply: bool,
}

impl TryFrom<StepRow> for WorkflowStep {
    type Error = WorkflowError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let corrupt = |e: leadline_shared::ParseEnumError| WorkflowError::Corrupt(format!("step {}: {}", row.id, e));

        Ok(WorkflowStep {
            id: row.id,
            workflow_id: row.workflow_id,
            step_order: row.step_order,
            trigger: row.trigger.parse().map_err(corrupt)?,
            channel: row.channel.parse().map_err(corrupt)?,
            audience: row.audience.parse().map_err(corrupt)?,
            recipients: serde_json::from_value::<RecipientConfig>(row.recipient_config)?,
            template_subject: row.template_subject,
            template_body: row.template_body,
            delay_minutes: row.delay_minutes,
            enabled: row.enabled,
            stop_on_reply: row.stop_on_reply,
        })
    }
}

#[derive(Debug, FromRow)]
struct OverrideRow {
    lead_id: Uuid,
    tenant_id: Uuid,
    override_mode: String,
    workflow_id: Option<Uuid>,
    reason: Option<String>,
    assigned_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn list_enabled_workflows(&self, tenant_id: Uuid) -> WorkflowResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, tenant_id, key, name, enabled,
                   quote_valid_days_override, quote_payment_days_override, created_at
            FROM workflows
            WHERE tenant_id = $1 AND enabled = true
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|w| w.id).collect();
        let step_rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, workflow_id, step_order, trigger, channel, audience, recipient_config,
                   template_subject, template_body, delay_minutes, enabled, stop_on_reply
            FROM workflow_steps
            WHERE workflow_id = ANY($1)
            ORDER BY step_order ASC, created_at ASC
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut steps: HashMap<Uuid, Vec<WorkflowStep>> = HashMap::new();
        for row in step_rows {
            let step = WorkflowStep::try_from(row)?;
            steps.entry(step.workflow_id).or_default().push(step);
        }

        Ok(rows
            .into_iter()
            .map(|row| Workflow {
                steps: steps.remove(&row.id).unwrap_or_default(),
                id: row.id,
                tenant_id: row.tenant_id,
                key: row.key,
                name: row.name,
                enabled: row.enabled,
                quote_valid_days_override: row.quote_valid_days_override,
                quote_payment_days_override: row.quote_payment_days_override,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn list_rules(&self, tenant_id: Uuid) -> WorkflowResult<Vec<WorkflowAssignmentRule>> {
        let rules = sqlx::query_as::<_, WorkflowAssignmentRule>(
            r#"
            SELECT id, tenant_id, workflow_id, lead_source, lead_service_type, pipeline_stage,
                   priority, enabled, created_at
            FROM workflow_assignment_rules
            WHERE tenant_id = $1
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    async fn get_override(&self, tenant_id: Uuid, lead_id: Uuid) -> WorkflowResult<Option<LeadWorkflowOverride>> {
        let row = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT lead_id, tenant_id, override_mode, workflow_id, reason, assigned_by, created_at, updated_at
            FROM lead_workflow_overrides
            WHERE tenant_id = $1 AND lead_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let mode = row
                .override_mode
                .parse::<OverrideMode>()
                .map_err(|e| WorkflowError::Corrupt(format!("override for lead {}: {}", row.lead_id, e)))?;
            Ok(LeadWorkflowOverride {
                lead_id: row.lead_id,
                tenant_id: row.tenant_id,
                mode,
                workflow_id: row.workflow_id,
                reason: row.reason,
                assigned_by: row.assigned_by,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        })
        .transpose()
    }

    async fn upsert_override(&self, record: LeadWorkflowOverride) -> WorkflowResult<()> {
        check_override(&record)?;

        sqlx::query(
            r#"
            INSERT INTO lead_workflow_overrides
            (lead_id, tenant_id, override_mode, workflow_id, reason, assigned_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (lead_id) DO UPDATE
            SET override_mode = EXCLUDED.override_mode,
                workflow_id = EXCLUDED.workflow_id,
                reason = EXCLUDED.reason,
                assigned_by = EXCLUDED.assigned_by,
                updated_at = NOW()
            WHERE lead_workflow_overrides.tenant_id = EXCLUDED.tenant_id
            "#,
        )
        .bind(record.lead_id)
        .bind(record.tenant_id)
        .bind(record.mode.as_str())
        .bind(record.workflow_id)
        .bind(&record.reason)
        .bind(record.assigned_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_override(&self, tenant_id: Uuid, lead_id: Uuid) -> WorkflowResult<bool> {
        let result = sqlx::query("DELETE FROM lead_workflow_overrides WHERE tenant_id = $1 AND lead_id = $2")
            .bind(tenant_id)
            .bind(lead_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ===== In-memory =====

#[cfg(test)]
pub use memory::MemoryWorkflowRepository;
