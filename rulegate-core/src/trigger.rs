//! Trigger collaborator contract.
//!
//! Side effects (email, webhook, audit log, notifications) are dispatched by an
//! external executor. The engine builds a [`TriggerContext`] and awaits the
//! executor sequentially; failures come back as [`TriggerError`] and never
//! abort a committed transition.

use crate::context::Operation;
use crate::error::TriggerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Optional parts of a trigger context.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub trigger_id: Option<String>,
    pub user_id: Option<String>,
    pub previous_data: Option<Value>,
    pub payload: Option<Value>,
    pub metadata: Map<String, Value>,
}

/// Everything a trigger executor needs to dispatch side effects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    /// Unique id for this dispatch, for correlation in downstream logs.
    pub dispatch_id: Uuid,
    pub entity: String,
    pub operation: Operation,
    pub entity_id: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl TriggerContext {
    pub fn new(
        entity: impl Into<String>,
        operation: Operation,
        entity_id: impl Into<String>,
        data: Value,
        opts: TriggerOptions,
    ) -> Self {
        Self {
            dispatch_id: Uuid::new_v4(),
            entity: entity.into(),
            operation,
            entity_id: entity_id.into(),
            data,
            trigger_id: opts.trigger_id,
            user_id: opts.user_id,
            previous_data: opts.previous_data,
            payload: opts.payload,
            metadata: opts.metadata,
            created_at: Utc::now(),
        }
    }
}

/// Dispatches triggers to downstream systems.
#[async_trait]
pub trait TriggerExecutor: Send + Sync {
    async fn execute_triggers(&self, ctx: TriggerContext) -> Result<(), TriggerError>;
}

/// Default executor: records the dispatch in the log and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTriggers;

#[async_trait]
impl TriggerExecutor for LoggingTriggers {
    async fn execute_triggers(&self, ctx: TriggerContext) -> Result<(), TriggerError> {
        tracing::info!(
            dispatch_id = %ctx.dispatch_id,
            entity = %ctx.entity,
            entity_id = %ctx.entity_id,
            operation = ctx.operation.as_str(),
            trigger = ctx.trigger_id.as_deref().unwrap_or("-"),
            "trigger dispatched"
        );
        Ok(())
    }
}
