//! Workflow - 名前付きの不変な DAG 定義

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use super::builder::Context;
use crate::domain::{
    Descriptor, DescriptorValidator, Page, Result, ShuttleError, WorkflowId, WorkflowRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    record: WorkflowRecord,
}

/// How a job names its workflow.
#[derive(Debug, Clone)]
pub enum WorkflowRef {
    Loaded(Workflow),
    Id(WorkflowId),
    Name(String),
}

impl From<Workflow> for WorkflowRef {
    fn from(workflow: Workflow) -> Self {
        Self::Loaded(workflow)
    }
}

impl From<&Workflow> for WorkflowRef {
    fn from(workflow: &Workflow) -> Self {
        Self::Loaded(workflow.clone())
    }
}

impl From<WorkflowId> for WorkflowRef {
    fn from(id: WorkflowId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for WorkflowRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for WorkflowRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl Workflow {
    /// 検証してから保存する。無効なら全エラーを持った `InvalidDescriptor`
    pub async fn create(ctx: &Context, name: &str, descriptor: &Value) -> Result<Self> {
        let descriptor = DescriptorValidator::new(descriptor).into_descriptor()?;
        let record = ctx.store().persist_workflow(name, &descriptor).await?;
        info!(workflow = %record.id, name, "workflow created");
        Ok(Self { record })
    }

    pub async fn find(ctx: &Context, id: WorkflowId) -> Result<Self> {
        ctx.store()
            .find_workflow(id)
            .await?
            .map(Self::from_record)
            .ok_or_else(|| ShuttleError::WorkflowNotFound {
                key: "id",
                value: id.to_string(),
            })
    }

    pub async fn find_by_name(ctx: &Context, name: &str) -> Result<Self> {
        ctx.store()
            .find_workflow_by_name(name)
            .await?
            .map(Self::from_record)
            .ok_or_else(|| ShuttleError::WorkflowNotFound {
                key: "name",
                value: name.to_string(),
            })
    }

    pub async fn resolve(ctx: &Context, workflow: WorkflowRef) -> Result<Self> {
        match workflow {
            WorkflowRef::Loaded(workflow) => Ok(workflow),
            WorkflowRef::Id(id) => Self::find(ctx, id).await,
            WorkflowRef::Name(name) => Self::find_by_name(ctx, &name).await,
        }
    }

    pub async fn select(ctx: &Context, page: Page) -> Result<Vec<Self>> {
        let records = ctx.store().select_workflows(page).await?;
        Ok(records.into_iter().map(Self::from_record).collect())
    }

    pub async fn count(ctx: &Context) -> Result<usize> {
        ctx.store().count_workflows().await
    }

    pub async fn delete(ctx: &Context, id: WorkflowId) -> Result<bool> {
        ctx.store().delete_workflow(id).await
    }

    pub async fn delete_by_name(ctx: &Context, name: &str) -> Result<bool> {
        ctx.store().delete_workflow_by_name(name).await
    }

    pub(crate) fn from_record(record: WorkflowRecord) -> Self {
        Self { record }
    }

    pub fn id(&self) -> WorkflowId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.record.descriptor
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn record(&self) -> &WorkflowRecord {
        &self.record
    }
}
