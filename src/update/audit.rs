//! Change log for applied update intents.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::error::{FactgraphError, Result};
use crate::graph::encode_ts;
use crate::tenant::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CreateNode,
    VersionEdge,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::CreateNode => "create_node",
            AuditAction::VersionEdge => "version_edge",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record per store change made by the Update Engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub tenant_id: TenantId,
    pub action: AuditAction,
    /// Node or edge the change is about, e.g. `Person:Alice`.
    pub subject: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
}

/// Destination for audit records. Failures are reported to the caller, who
/// logs them; they never abort an update.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Writes records through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        log::info!(
            "kg change tenant={} action={} subject={} detail={}",
            record.tenant_id,
            record.action,
            record.subject,
            record.detail
        );
        Ok(())
    }
}

/// Persists records into the `kg_changes` table.
#[derive(Debug, Clone)]
pub struct SqliteAuditSink {
    db: Db,
}

impl SqliteAuditSink {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Most recent changes for a tenant, newest first.
    pub async fn recent(&self, tenant: &TenantId, limit: usize) -> Result<Vec<AuditRecord>> {
        let tenant = tenant.clone();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT action, subject, detail, created_at, task_id FROM kg_changes \
                     WHERE tenant_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![tenant.as_str(), limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let action: String = row.get(0)?;
                    let action = match action.as_str() {
                        "create_node" => AuditAction::CreateNode,
                        "version_edge" => AuditAction::VersionEdge,
                        other => {
                            return Err(FactgraphError::InvalidInput(format!(
                                "unknown audit action {}",
                                other
                            )))
                        }
                    };
                    out.push(AuditRecord {
                        tenant_id: tenant.clone(),
                        action,
                        subject: row.get(1)?,
                        detail: row.get(2)?,
                        timestamp: crate::graph::ts_column(row, 3)?,
                        task_id: row.get(4)?,
                    });
                }
                Ok(out)
            })
            .await
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        let tenant = record.tenant_id.as_str().to_string();
        let action = record.action.as_str();
        let subject = record.subject.clone();
        let detail = record.detail.clone();
        let task_id = record.task_id.clone();
        let created_at = encode_ts(&record.timestamp);

        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO kg_changes (tenant_id, action, subject, detail, task_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![tenant, action, subject, detail, task_id, created_at],
                )?;
                Ok(())
            })
            .await
    }
}
