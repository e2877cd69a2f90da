//! Tenant scoping.
//!
//! Every graph store read and write takes a [`TenantId`]. The only way to get
//! one is [`TenantId::new`] / [`TenantId::require`], which fail closed with
//! `TenantMismatch` instead of defaulting to "all tenants".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FactgraphError, Result};

const MAX_TENANT_LEN: usize = 128;

/// Validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate a caller-supplied tenant id.
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FactgraphError::TenantMismatch(
                "tenant filter is empty".to_string(),
            ));
        }
        if trimmed.len() > MAX_TENANT_LEN {
            return Err(FactgraphError::TenantMismatch(format!(
                "tenant id longer than {} bytes",
                MAX_TENANT_LEN
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
        {
            return Err(FactgraphError::TenantMismatch(format!(
                "tenant id contains forbidden characters: {:?}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Validate an optional tenant filter; absence is a `TenantMismatch`.
    pub fn require(raw: Option<&str>) -> Result<Self> {
        match raw {
            Some(raw) => Self::new(raw),
            None => Err(FactgraphError::TenantMismatch(
                "tenant filter is absent".to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = FactgraphError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}
