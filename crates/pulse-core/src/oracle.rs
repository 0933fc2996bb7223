//! Filter oracle: the external judge of deposits.
//!
//! The scheduler branches only on [`Verdict`]; all semantic judgment lives
//! behind [`FilterOracle`]. Every call is bounded by [`judge_bounded`], and a
//! timeout or error means "not judged yet", never PASS.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pulse_state::{BuildId, DepositRecord, DepositStatus};
use serde::{Deserialize, Serialize};

/// Filter outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub met: bool,
}

/// Oracle judgment of one deposit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub drop_id: String,
    pub verdict: Verdict,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub criteria_results: Vec<CriterionResult>,
    #[serde(default)]
    pub concerns: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The judge has not produced a verdict yet.
    #[error("verdict pending for drop {0}")]
    Pending(String),

    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),

    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("invalid verdict: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait FilterOracle: Send + Sync {
    async fn judge(
        &self,
        build: &BuildId,
        brief: &str,
        deposit: &DepositRecord,
    ) -> Result<FilterVerdict, OracleError>;
}

/// Run `judge` under a deadline.
pub async fn judge_bounded(
    oracle: &dyn FilterOracle,
    build: &BuildId,
    brief: &str,
    deposit: &DepositRecord,
    limit: Duration,
) -> Result<FilterVerdict, OracleError> {
    match tokio::time::timeout(limit, oracle.judge(build, brief, deposit)).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(limit)),
    }
}

/// Deterministic oracle driven by the deposit's own status.
///
/// `complete` passes (warns when the deposit broadcasts a concern);
/// `failed` and `blocked` fail with the summary as reasoning.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepositStatusOracle;

#[async_trait]
impl FilterOracle for DepositStatusOracle {
    async fn judge(
        &self,
        _build: &BuildId,
        _brief: &str,
        deposit: &DepositRecord,
    ) -> Result<FilterVerdict, OracleError> {
        let (verdict, concerns) = match (deposit.status, &deposit.broadcast) {
            (DepositStatus::Complete, None) => (Verdict::Pass, Vec::new()),
            (DepositStatus::Complete, Some(concern)) => (Verdict::Warn, vec![concern.clone()]),
            (DepositStatus::Failed | DepositStatus::Blocked, _) => (Verdict::Fail, Vec::new()),
        };
        Ok(FilterVerdict {
            drop_id: deposit.drop_id.clone(),
            verdict,
            confidence: 1.0,
            reasoning: deposit.summary.clone(),
            criteria_results: Vec::new(),
            concerns,
        })
    }
}

/// Reads verdicts written by an external judge to
/// `<root>/builds/<build>/filters/<drop>.json`.
#[derive(Debug, Clone)]
pub struct VerdictFileOracle {
    root: PathBuf,
}

impl VerdictFileOracle {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    pub fn verdict_path(&self, build: &BuildId, drop_id: &str) -> PathBuf {
        self.root
            .join("builds")
            .join(build.as_str())
            .join("filters")
            .join(format!("{drop_id}.json"))
    }
}

#[async_trait]
impl FilterOracle for VerdictFileOracle {
    async fn judge(
        &self,
        build: &BuildId,
        _brief: &str,
        deposit: &DepositRecord,
    ) -> Result<FilterVerdict, OracleError> {
        let path = self.verdict_path(build, &deposit.drop_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OracleError::Pending(deposit.drop_id.clone()))
            }
            Err(e) => return Err(OracleError::Unavailable(e.to_string())),
        };
        let verdict: FilterVerdict =
            serde_json::from_slice(&bytes).map_err(|e| OracleError::Invalid(e.to_string()))?;
        if verdict.drop_id != deposit.drop_id {
            return Err(OracleError::Invalid(format!(
                "verdict for {} found in {}",
                verdict.drop_id,
                path.display()
            )));
        }
        if !(0.0..=1.0).contains(&verdict.confidence) {
            return Err(OracleError::Invalid(format!(
                "confidence {} outside 0..1",
                verdict.confidence
            )));
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowOracle;

    #[async_trait]
    impl FilterOracle for SlowOracle {
        async fn judge(
            &self,
            _build: &BuildId,
            _brief: &str,
            deposit: &DepositRecord,
        ) -> Result<FilterVerdict, OracleError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            DepositStatusOracle.judge(&BuildId::new("b"), "", deposit).await
        }
    }

    #[tokio::test]
    async fn deposit_status_maps_to_verdict() {
        let build = BuildId::new("b");
        let mut deposit = DepositRecord::new("d", DepositStatus::Complete, "ok");
        let v = DepositStatusOracle.judge(&build, "", &deposit).await.unwrap();
        assert_eq!(v.verdict, Verdict::Pass);

        deposit.broadcast = Some("flaky test skipped".into());
        let v = DepositStatusOracle.judge(&build, "", &deposit).await.unwrap();
        assert_eq!(v.verdict, Verdict::Warn);
        assert_eq!(v.concerns, vec!["flaky test skipped".to_string()]);

        let failed = DepositRecord::new("d", DepositStatus::Blocked, "missing creds");
        let v = DepositStatusOracle.judge(&build, "", &failed).await.unwrap();
        assert_eq!(v.verdict, Verdict::Fail);
        assert_eq!(v.reasoning, "missing creds");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_an_error_not_a_pass() {
        let deposit = DepositRecord::new("d", DepositStatus::Complete, "ok");
        let result = judge_bounded(
            &SlowOracle,
            &BuildId::new("b"),
            "",
            &deposit,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(OracleError::Timeout(_))));
    }

    #[tokio::test]
    async fn verdict_file_pending_until_written() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = VerdictFileOracle::new(dir.path());
        let build = BuildId::new("b");
        let deposit = DepositRecord::new("d1", DepositStatus::Complete, "ok");

        let err = oracle.judge(&build, "", &deposit).await.unwrap_err();
        assert!(matches!(err, OracleError::Pending(_)));

        let path = oracle.verdict_path(&build, "d1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"drop_id":"d1","verdict":"FAIL","confidence":0.8,"reasoning":"API returns 500",
                "criteria_results":[{"criterion":"endpoint works","met":false}],"concerns":[]}"#,
        )
        .unwrap();
        let v = oracle.judge(&build, "", &deposit).await.unwrap();
        assert_eq!(v.verdict, Verdict::Fail);
        assert!(!v.criteria_results[0].met);
    }

    #[tokio::test]
    async fn verdict_file_rejects_bad_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = VerdictFileOracle::new(dir.path());
        let build = BuildId::new("b");
        let path = oracle.verdict_path(&build, "d1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"drop_id":"d1","verdict":"PASS","confidence":1.5}"#).unwrap();
        let deposit = DepositRecord::new("d1", DepositStatus::Complete, "ok");
        let err = oracle.judge(&build, "", &deposit).await.unwrap_err();
        assert!(matches!(err, OracleError::Invalid(_)));
    }
}
