use crate::runner::state::TestResult;
use serde::{Deserialize, Serialize};

/// Totals over one `mut run` session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Test results for report generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub session_id: String,
    pub tests: Vec<TestResult>,
    pub summary: RunSummary,
    pub generated_at: String,
}

impl TestResults {
    pub fn new(session_id: &str, tests: Vec<TestResult>, duration_ms: u64) -> Self {
        let passed = tests.iter().filter(|t| t.is_passed()).count();
        let summary = RunSummary {
            total: tests.len(),
            passed,
            failed: tests.len() - passed,
            duration_ms,
        };
        Self {
            session_id: session_id.to_string(),
            tests,
            summary,
            generated_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::state::{ErrorKind, StepError};

    #[test]
    fn test_summary_counts() {
        let mut failed = TestResult::new("checkout");
        failed.fail(StepError::new(ErrorKind::Timeout, "slow"));
        let results = TestResults::new("s-1", vec![TestResult::new("login"), failed], 1200);

        assert_eq!(
            results.summary,
            RunSummary {
                total: 2,
                passed: 1,
                failed: 1,
                duration_ms: 1200
            }
        );
        assert!(!results.all_passed());
    }
}
