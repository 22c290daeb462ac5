use tracing::debug;

use foreman_core::error::{ForemanError, Result};
use foreman_core::types::WorkRequest;

/// One classification rule: any keyword hit routes to the worker.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub keywords: Vec<String>,
    pub worker_id: String,
}

/// Routing decision for an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Worker(String),
    Workflow(String),
}

/// Classifies requests into a worker or workflow target.
///
/// Strict precedence: an explicit worker id wins, then an explicit workflow
/// type, then the ordered keyword table. The table is first-match-wins
/// (later rules never override an earlier hit) and falls back to a default
/// general-purpose worker.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RouteRule>,
    default_worker: String,
}

impl Router {
    pub fn new(default_worker: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_worker: default_worker.into(),
        }
    }

    /// Append a rule. Order of insertion is the order of precedence.
    pub fn rule(mut self, keywords: &[&str], worker_id: impl Into<String>) -> Self {
        self.rules.push(RouteRule {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            worker_id: worker_id.into(),
        });
        self
    }

    /// The stock financial routing table.
    pub fn financial_defaults() -> Self {
        Self::new("ai_cfo_agent")
            .rule(
                &["forecast", "predict", "projection", "trend", "future"],
                "forecasting_agent",
            )
            .rule(
                &["alert", "warning", "risk", "threshold", "monitor"],
                "alert_agent",
            )
            .rule(
                &["report", "summary", "brief", "dashboard", "analysis"],
                "reporting_agent",
            )
            .rule(
                &["ocr", "scan", "receipt", "invoice", "document"],
                "ocr_agent",
            )
            .rule(
                &["sync", "integration", "import", "export", "data"],
                "data_sync_agent",
            )
            .rule(
                &["reconcile", "match", "balance", "statement"],
                "reconciliation_agent",
            )
    }

    pub fn default_worker(&self) -> &str {
        &self.default_worker
    }

    /// Classify request content against the rule table.
    /// Case-insensitive substring matching, first match wins.
    pub fn classify(&self, content: &str) -> &str {
        let content = content.to_lowercase();
        for rule in &self.rules {
            if rule.keywords.iter().any(|k| content.contains(k.as_str())) {
                debug!(worker_id = %rule.worker_id, "Request classified by keyword rule");
                return &rule.worker_id;
            }
        }
        debug!(worker_id = %self.default_worker, "Request fell through to default worker");
        &self.default_worker
    }

    /// Resolve a full request with explicit-hint precedence.
    ///
    /// An explicit hint naming an unregistered target is an error, never a
    /// silent fallthrough to classification.
    pub fn resolve(
        &self,
        request: &WorkRequest,
        worker_registered: impl Fn(&str) -> bool,
        workflow_registered: impl Fn(&str) -> bool,
    ) -> Result<Route> {
        if let Some(worker_id) = &request.preferred_worker {
            if worker_registered(worker_id) {
                return Ok(Route::Worker(worker_id.clone()));
            }
            return Err(ForemanError::WorkerNotFound(worker_id.clone()));
        }

        if let Some(workflow_type) = &request.workflow_type {
            if workflow_registered(workflow_type) {
                return Ok(Route::Workflow(workflow_type.clone()));
            }
            return Err(ForemanError::WorkflowNotFound(workflow_type.clone()));
        }

        Ok(Route::Worker(self.classify(&request.content).to_string()))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::financial_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_first_match_wins() {
        // "risk" (rule 2) appears before the "report" rule would match
        // "analysis"; insertion order decides.
        let router = Router::financial_defaults();
        assert_eq!(
            router.classify("Run a risk analysis for the quarter"),
            "alert_agent"
        );
    }

    #[test]
    fn classify_is_case_insensitive() {
        let router = Router::financial_defaults();
        assert_eq!(router.classify("FORECAST next quarter"), "forecasting_agent");
    }

    #[test]
    fn classify_falls_back_to_default() {
        let router = Router::financial_defaults();
        assert_eq!(router.classify("hello there"), "ai_cfo_agent");
    }

    #[test]
    fn later_rules_never_override_earlier_match() {
        let router = Router::new("default")
            .rule(&["invoice"], "first")
            .rule(&["invoice", "payment"], "second");
        assert_eq!(router.classify("process this invoice payment"), "first");
    }

    #[test]
    fn resolve_prefers_explicit_worker() {
        let router = Router::financial_defaults();
        let request = WorkRequest::new("forecast revenue").with_worker("ocr_agent");
        let route = router.resolve(&request, |_| true, |_| true).unwrap();
        assert_eq!(route, Route::Worker("ocr_agent".into()));
    }

    #[test]
    fn resolve_unknown_explicit_worker_is_an_error() {
        let router = Router::financial_defaults();
        let request = WorkRequest::new("anything").with_worker("ghost");
        let err = router.resolve(&request, |_| false, |_| true).unwrap_err();
        assert!(matches!(err, ForemanError::WorkerNotFound(_)));
    }

    #[test]
    fn resolve_explicit_workflow_after_worker() {
        let router = Router::financial_defaults();
        let request = WorkRequest::new("process invoices").with_workflow("transactional");
        let route = router.resolve(&request, |_| true, |_| true).unwrap();
        assert_eq!(route, Route::Workflow("transactional".into()));
    }

    #[test]
    fn resolve_unknown_workflow_is_an_error() {
        let router = Router::financial_defaults();
        let request = WorkRequest::new("anything").with_workflow("mystery");
        let err = router.resolve(&request, |_| true, |_| false).unwrap_err();
        assert!(matches!(err, ForemanError::WorkflowNotFound(_)));
    }

    #[test]
    fn resolve_without_hints_classifies() {
        let router = Router::financial_defaults();
        let request = WorkRequest::new("reconcile the bank statement");
        let route = router.resolve(&request, |_| true, |_| true).unwrap();
        assert_eq!(route, Route::Worker("reconciliation_agent".into()));
    }
}
