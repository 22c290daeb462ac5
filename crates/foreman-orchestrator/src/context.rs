use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use foreman_core::error::{ForemanError, Result};
use foreman_core::event::EventBus;
use foreman_core::types::{AgentContext, SessionId, WorkflowEvent, WorkflowState};

struct ContextSlot {
    created_at: DateTime<Utc>,
    // The per-session lock: all mutation of this context goes through it.
    ctx: Arc<Mutex<AgentContext>>,
}

/// Summary counters for the store.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub active_contexts: usize,
    pub companies: usize,
    pub contexts_by_company: HashMap<String, usize>,
}

/// Owns per-session execution contexts and company-scoped shared state.
///
/// The registry lock only guards the session table; context state is
/// mutated under each session's own lock. Operations spanning two sessions
/// acquire both locks in ascending session-id order, so two concurrent
/// cross-shares can never deadlock on the same pair.
pub struct ContextStore {
    contexts: Mutex<HashMap<SessionId, ContextSlot>>,
    shared: Mutex<HashMap<String, HashMap<String, serde_json::Value>>>,
    event_bus: Arc<EventBus>,
}

impl ContextStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            shared: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Create and register a new session context, ensuring the company's
    /// shared bucket exists.
    pub async fn create(
        &self,
        worker_id: &str,
        user_id: &str,
        company_id: &str,
        permissions: Vec<String>,
        initial_state: HashMap<String, serde_json::Value>,
    ) -> AgentContext {
        let mut context = AgentContext::new(worker_id, user_id, company_id);
        context.permissions = permissions;
        context.state = initial_state;

        self.shared
            .lock()
            .await
            .entry(company_id.to_string())
            .or_default();

        self.register(context.clone()).await;

        info!(
            session_id = %context.session_id,
            worker_id,
            user_id,
            company_id,
            "Context created"
        );

        context
    }

    async fn register(&self, context: AgentContext) {
        let slot = ContextSlot {
            created_at: context.created_at,
            ctx: Arc::new(Mutex::new(context.clone())),
        };
        self.contexts
            .lock()
            .await
            .insert(context.session_id.clone(), slot);
    }

    /// Cloned snapshot of a session's context.
    pub async fn get(&self, session_id: &SessionId) -> Option<AgentContext> {
        let slot = {
            let contexts = self.contexts.lock().await;
            contexts.get(session_id).map(|s| s.ctx.clone())
        };
        match slot {
            Some(ctx) => Some(ctx.lock().await.clone()),
            None => None,
        }
    }

    /// Apply state updates under the session's lock.
    /// `merge` extends the existing map; otherwise the map is replaced.
    pub async fn update_state(
        &self,
        session_id: &SessionId,
        updates: HashMap<String, serde_json::Value>,
        merge: bool,
    ) -> Result<()> {
        let slot = {
            let contexts = self.contexts.lock().await;
            contexts
                .get(session_id)
                .map(|s| s.ctx.clone())
                .ok_or_else(|| ForemanError::SessionNotFound(session_id.to_string()))?
        };

        let mut ctx = slot.lock().await;
        if merge {
            ctx.state.extend(updates);
        } else {
            ctx.state = updates;
        }
        debug!(session_id = %session_id, "Context state updated");
        Ok(())
    }

    /// Copy selected (or all) state keys from one session into another.
    ///
    /// Both session locks are taken in ascending session-id order
    /// regardless of argument order.
    pub async fn share(
        &self,
        source: &SessionId,
        target: &SessionId,
        keys: Option<&[&str]>,
    ) -> Result<()> {
        if source == target {
            return Ok(());
        }

        let (source_slot, target_slot) = {
            let contexts = self.contexts.lock().await;
            let source_slot = contexts
                .get(source)
                .map(|s| s.ctx.clone())
                .ok_or_else(|| ForemanError::SessionNotFound(source.to_string()))?;
            let target_slot = contexts
                .get(target)
                .map(|s| s.ctx.clone())
                .ok_or_else(|| ForemanError::SessionNotFound(target.to_string()))?;
            (source_slot, target_slot)
        };

        // Canonical acquisition order: lower session id first.
        let (first, second, source_is_first) = if source < target {
            (&source_slot, &target_slot, true)
        } else {
            (&target_slot, &source_slot, false)
        };

        let mut first_guard = first.lock().await;
        let mut second_guard = second.lock().await;
        let (source_ctx, target_ctx) = if source_is_first {
            (&*first_guard, &mut *second_guard)
        } else {
            (&*second_guard, &mut *first_guard)
        };

        match keys {
            Some(keys) => {
                for key in keys {
                    if let Some(value) = source_ctx.state.get(*key) {
                        target_ctx.state.insert((*key).to_string(), value.clone());
                    }
                }
            }
            None => {
                let snapshot: Vec<(String, serde_json::Value)> = source_ctx
                    .state
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                target_ctx.state.extend(snapshot);
            }
        }

        info!(
            source = %source,
            target = %target,
            keys = ?keys,
            "Context data shared"
        );
        Ok(())
    }

    /// Read company-scoped shared state; `key == None` returns the whole map.
    pub async fn shared_state(
        &self,
        company_id: &str,
        key: Option<&str>,
    ) -> Option<serde_json::Value> {
        let shared = self.shared.lock().await;
        let bucket = shared.get(company_id)?;
        match key {
            Some(key) => bucket.get(key).cloned(),
            None => Some(serde_json::to_value(bucket).unwrap_or(serde_json::Value::Null)),
        }
    }

    /// Write one key into a company's shared bucket.
    pub async fn update_shared_state(
        &self,
        company_id: &str,
        key: &str,
        value: serde_json::Value,
    ) {
        self.shared
            .lock()
            .await
            .entry(company_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        debug!(company_id, key, "Shared state updated");
    }

    /// Derive and register a context for a workflow run.
    ///
    /// Inherits identity, permissions, and a state snapshot from the base
    /// context when given, then stamps the workflow's own keys on top.
    pub async fn derive_workflow_context(
        &self,
        state: &WorkflowState,
        base: Option<&AgentContext>,
    ) -> AgentContext {
        let mut context = match base {
            Some(base) => {
                let mut ctx =
                    AgentContext::new("workflow_orchestrator", &base.user_id, &base.company_id);
                ctx.permissions = base.permissions.clone();
                ctx.state = base.state.clone();
                ctx
            }
            None => AgentContext::system("workflow_orchestrator"),
        };

        context.state.insert(
            "workflow_id".to_string(),
            serde_json::Value::String(state.workflow_id.to_string()),
        );
        context.state.insert(
            "workflow_type".to_string(),
            serde_json::Value::String(state.workflow_type.clone()),
        );
        context
            .state
            .insert("workflow_data".to_string(), state.data.clone());

        self.register(context.clone()).await;

        info!(
            workflow_id = %state.workflow_id,
            session_id = %context.session_id,
            "Workflow context created"
        );

        context
    }

    /// Drop a session and its lock.
    pub async fn remove(&self, session_id: &SessionId) -> bool {
        self.contexts.lock().await.remove(session_id).is_some()
    }

    /// Remove every context older than `ttl`. Returns the number removed.
    pub async fn cleanup_expired(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));

        let expired: Vec<SessionId> = {
            let contexts = self.contexts.lock().await;
            contexts
                .iter()
                .filter(|(_, slot)| slot.created_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut removed = 0;
        for session_id in expired {
            if self.remove(&session_id).await {
                self.event_bus.publish(WorkflowEvent::ContextExpired {
                    session_id: session_id.clone(),
                });
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Expired contexts cleaned up");
        }
        removed
    }

    /// Periodic expiry sweep. Blocks until cancelled.
    pub async fn run_cleanup(&self, interval: Duration, ttl: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.cleanup_expired(ttl).await;
                }
                _ = cancel.cancelled() => {
                    debug!("Context cleanup task shutting down");
                    break;
                }
            }
        }
    }

    pub async fn stats(&self) -> ContextStats {
        let contexts = self.contexts.lock().await;
        let mut by_company: HashMap<String, usize> = HashMap::new();
        for slot in contexts.values() {
            let company = slot.ctx.lock().await.company_id.clone();
            *by_company.entry(company).or_default() += 1;
        }
        ContextStats {
            active_contexts: contexts.len(),
            companies: self.shared.lock().await.len(),
            contexts_by_company: by_company,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Arc<ContextStore> {
        Arc::new(ContextStore::new(Arc::new(EventBus::default())))
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = store();
        let ctx = store
            .create("worker", "user-1", "acme", vec!["read".into()], HashMap::new())
            .await;

        let fetched = store.get(&ctx.session_id).await.unwrap();
        assert_eq!(fetched.user_id, "user-1");
        assert_eq!(fetched.company_id, "acme");
        assert_eq!(fetched.permissions, vec!["read"]);

        // Company shared bucket was created
        assert!(store.shared_state("acme", None).await.is_some());
    }

    #[tokio::test]
    async fn update_state_merge_and_replace() {
        let store = store();
        let ctx = store
            .create(
                "worker",
                "user",
                "acme",
                vec![],
                HashMap::from([("a".to_string(), json!(1))]),
            )
            .await;

        store
            .update_state(
                &ctx.session_id,
                HashMap::from([("b".to_string(), json!(2))]),
                true,
            )
            .await
            .unwrap();
        let merged = store.get(&ctx.session_id).await.unwrap();
        assert_eq!(merged.state.len(), 2);

        store
            .update_state(
                &ctx.session_id,
                HashMap::from([("c".to_string(), json!(3))]),
                false,
            )
            .await
            .unwrap();
        let replaced = store.get(&ctx.session_id).await.unwrap();
        assert_eq!(replaced.state.len(), 1);
        assert_eq!(replaced.state["c"], json!(3));
    }

    #[tokio::test]
    async fn update_unknown_session() {
        let store = store();
        let err = store
            .update_state(&SessionId::new(), HashMap::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn share_selected_keys() {
        let store = store();
        let a = store
            .create(
                "w",
                "u",
                "acme",
                vec![],
                HashMap::from([
                    ("x".to_string(), json!("shared")),
                    ("y".to_string(), json!("private")),
                ]),
            )
            .await;
        let b = store.create("w", "u", "acme", vec![], HashMap::new()).await;

        store
            .share(&a.session_id, &b.session_id, Some(&["x"]))
            .await
            .unwrap();

        let target = store.get(&b.session_id).await.unwrap();
        assert_eq!(target.state.get("x"), Some(&json!("shared")));
        assert!(!target.state.contains_key("y"));
    }

    #[tokio::test]
    async fn share_all_keys() {
        let store = store();
        let a = store
            .create(
                "w",
                "u",
                "acme",
                vec![],
                HashMap::from([("x".to_string(), json!(1)), ("y".to_string(), json!(2))]),
            )
            .await;
        let b = store.create("w", "u", "acme", vec![], HashMap::new()).await;

        store.share(&a.session_id, &b.session_id, None).await.unwrap();
        assert_eq!(store.get(&b.session_id).await.unwrap().state.len(), 2);
    }

    #[tokio::test]
    async fn share_with_self_is_noop() {
        let store = store();
        let a = store.create("w", "u", "acme", vec![], HashMap::new()).await;
        store.share(&a.session_id, &a.session_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn shared_state_roundtrip() {
        let store = store();
        store
            .update_shared_state("acme", "fiscal_year", json!(2026))
            .await;
        assert_eq!(
            store.shared_state("acme", Some("fiscal_year")).await,
            Some(json!(2026))
        );
        assert_eq!(store.shared_state("acme", Some("missing")).await, None);
        assert_eq!(store.shared_state("ghost-co", Some("k")).await, None);
    }

    #[tokio::test]
    async fn derive_workflow_context_inherits_base() {
        let store = store();
        let base = store
            .create(
                "w",
                "ceo",
                "acme",
                vec!["approve".into()],
                HashMap::from([("quarter".to_string(), json!("Q3"))]),
            )
            .await;

        let state = WorkflowState::new("advisory", json!({"request": "analyze"}), base.clone());
        let derived = store.derive_workflow_context(&state, Some(&base)).await;

        assert_ne!(derived.session_id, base.session_id);
        assert_eq!(derived.user_id, "ceo");
        assert_eq!(derived.permissions, vec!["approve"]);
        assert_eq!(derived.state.get("quarter"), Some(&json!("Q3")));
        assert_eq!(
            derived.state.get("workflow_type"),
            Some(&json!("advisory"))
        );
        // Registered under its own session
        assert!(store.get(&derived.session_id).await.is_some());
    }

    #[tokio::test]
    async fn cleanup_expired_removes_old_contexts() {
        let store = store();
        let ctx = store.create("w", "u", "acme", vec![], HashMap::new()).await;

        // Nothing is older than an hour
        assert_eq!(store.cleanup_expired(Duration::from_secs(3600)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = store.cleanup_expired(Duration::from_millis(1)).await;
        assert_eq!(removed, 1);
        assert!(store.get(&ctx.session_id).await.is_none());
    }

    #[tokio::test]
    async fn stats_counts_by_company() {
        let store = store();
        store.create("w", "u", "acme", vec![], HashMap::new()).await;
        store.create("w", "u", "acme", vec![], HashMap::new()).await;
        store.create("w", "u", "globex", vec![], HashMap::new()).await;

        let stats = store.stats().await;
        assert_eq!(stats.active_contexts, 3);
        assert_eq!(stats.contexts_by_company["acme"], 2);
        assert_eq!(stats.contexts_by_company["globex"], 1);
    }
}
