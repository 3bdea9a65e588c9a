use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::market::Timeframe;
use crate::domain::strategy::StrategyDefinition;

/// Lifecycle of a single backtest job. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(anyhow!("Unknown job status: {}", s)),
        }
    }
}

/// Aggregate lifecycle of a batch of correlated jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyFailed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::PartiallyFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::PartiallyFailed => "PARTIALLY_FAILED",
        }
    }

    /// Status implied by the batch counters. Mirrors the conditional UPDATE
    /// the batch store runs, for use in tests and pre-failed seeding.
    pub fn derive(completed: i32, failed: i32, total: i32) -> BatchStatus {
        if total > 0 && completed + failed == total {
            if failed == total {
                BatchStatus::Failed
            } else if completed == total {
                BatchStatus::Completed
            } else {
                BatchStatus::PartiallyFailed
            }
        } else if completed > 0 || failed > 0 {
            BatchStatus::Running
        } else {
            BatchStatus::Pending
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(BatchStatus::Pending),
            "RUNNING" => Ok(BatchStatus::Running),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "PARTIALLY_FAILED" => Ok(BatchStatus::PartiallyFailed),
            _ => Err(anyhow!("Unknown batch status: {}", s)),
        }
    }
}

/// Everything the orchestrator needs about one job, loaded from the
/// relational store. The strategy definition is the snapshot taken at
/// submission, not the live row.
#[derive(Debug, Clone)]
pub struct BacktestJobDetails {
    pub id: Uuid,
    pub user_id: Uuid,
    pub strategy_id: Uuid,
    pub ticker: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: JobStatus,
    pub strategy_definition: StrategyDefinition,
    pub simulation_params: serde_json::Value,
    pub batch_id: Option<Uuid>,
    pub counts_towards_limit: bool,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_status_derivation() {
        assert_eq!(BatchStatus::derive(0, 0, 3), BatchStatus::Pending);
        assert_eq!(BatchStatus::derive(1, 0, 3), BatchStatus::Running);
        assert_eq!(BatchStatus::derive(0, 1, 3), BatchStatus::Running);
        assert_eq!(BatchStatus::derive(3, 0, 3), BatchStatus::Completed);
        assert_eq!(BatchStatus::derive(0, 3, 3), BatchStatus::Failed);
        assert_eq!(BatchStatus::derive(2, 1, 3), BatchStatus::PartiallyFailed);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(BatchStatus::PartiallyFailed.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            "PARTIALLY_FAILED".parse::<BatchStatus>().unwrap(),
            BatchStatus::PartiallyFailed
        );
    }
}
