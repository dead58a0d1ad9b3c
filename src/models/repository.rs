use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A named container of backup images plus metadata.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub kind: String, // enum: 'local', 'nfs', 'cifs', 'object'
    pub config: Value,
    pub enabled: bool,
    pub immutable: bool,
    pub retention_days: i32,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Storage backends a repository can live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Local,
    Nfs,
    Cifs,
    Object,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryKind::Local => "local",
            RepositoryKind::Nfs => "nfs",
            RepositoryKind::Cifs => "cifs",
            RepositoryKind::Object => "object",
        }
    }
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(RepositoryKind::Local),
            "nfs" => Ok(RepositoryKind::Nfs),
            "cifs" => Ok(RepositoryKind::Cifs),
            "object" => Ok(RepositoryKind::Object),
            other => Err(format!("unknown repository kind '{}'", other)),
        }
    }
}
