//! Status enums persisted as text in the claim store

use serde::{Deserialize, Serialize};

/// Claim state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Claimed,
    Success,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Claimed => "claimed",
            WorkStatus::Success => "success",
            WorkStatus::Failed => "failed",
        }
    }
}

impl From<String> for WorkStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => WorkStatus::Pending,
            "claimed" => WorkStatus::Claimed,
            "success" => WorkStatus::Success,
            "failed" => WorkStatus::Failed,
            _ => WorkStatus::Pending,
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one extraction attempt, stored on the enriched record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Success,
    Failed,
}

impl ScrapeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeStatus::Success => "success",
            ScrapeStatus::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScrapeStatus::Success)
    }
}

impl From<String> for ScrapeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "success" => ScrapeStatus::Success,
            _ => ScrapeStatus::Failed,
        }
    }
}

impl std::fmt::Display for ScrapeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_status_text_round_trip() {
        for status in [
            WorkStatus::Pending,
            WorkStatus::Claimed,
            WorkStatus::Success,
            WorkStatus::Failed,
        ] {
            assert_eq!(WorkStatus::from(status.as_str().to_string()), status);
        }
        assert_eq!(WorkStatus::from("bogus".to_string()), WorkStatus::Pending);
    }

    #[test]
    fn test_scrape_status_serde() {
        let json = serde_json::to_string(&ScrapeStatus::Success).unwrap_or_default();
        assert_eq!(json, "\"success\"");
        assert_eq!(ScrapeStatus::from("weird".to_string()), ScrapeStatus::Failed);
    }
}
