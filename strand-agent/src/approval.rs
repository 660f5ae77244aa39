//! Resolution path for tool calls waiting on a human decision.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use strand_core::event::StreamEvent;
use strand_core::tool_call::{
    ConfirmationDetails, ConfirmationKind, ConfirmationOutcome, ToolCallRequest,
};

use crate::scheduler::ApprovalGate;

pub const WRITE_FILE_TOOL_NAME: &str = "write_file";
pub const USER_CONFIRM_TOOL_NAME: &str = "user_confirm";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pending confirmations keyed by call id.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<ConfirmationOutcome>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call as awaiting a decision. A second registration replaces the first.
    pub fn register(&self, call_id: &str) -> oneshot::Receiver<ConfirmationOutcome> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(call_id.to_string(), tx);
        rx
    }

    /// Deliver `outcome` to the waiter. Returns false if nothing was waiting.
    pub fn resolve(&self, call_id: &str, outcome: ConfirmationOutcome) -> bool {
        let Some(tx) = lock(&self.pending).remove(call_id) else {
            return false;
        };
        let delivered = tx.send(outcome).is_ok();
        tracing::debug!(call_id, ?outcome, delivered, "confirmation resolved");
        delivered
    }

    pub fn forget(&self, call_id: &str) {
        lock(&self.pending).remove(call_id);
    }

    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.pending).keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Drops the pending entry when the waiting future goes away.
struct PendingGuard<'a> {
    broker: &'a ApprovalBroker,
    call_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.forget(self.call_id);
    }
}

/// Gate installed by chat sessions: dangerous tools wait for the broker.
pub struct ChatApprovalGate {
    broker: Arc<ApprovalBroker>,
    dangerous_tools: Vec<String>,
    always_allowed: Arc<Mutex<HashSet<String>>>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl ChatApprovalGate {
    pub fn new(
        broker: Arc<ApprovalBroker>,
        dangerous_tools: Vec<String>,
        always_allowed: Arc<Mutex<HashSet<String>>>,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            broker,
            dangerous_tools,
            always_allowed,
            events,
        }
    }
}

#[async_trait]
impl ApprovalGate for ChatApprovalGate {
    fn requires_approval(&self, request: &ToolCallRequest) -> bool {
        self.dangerous_tools.contains(&request.name)
            && !lock(&self.always_allowed).contains(&request.name)
    }

    fn confirmation_details(&self, request: &ToolCallRequest) -> ConfirmationDetails {
        let (kind, message) = match request.name.as_str() {
            WRITE_FILE_TOOL_NAME => (ConfirmationKind::Edit, "Apply this change?".to_string()),
            USER_CONFIRM_TOOL_NAME => (
                ConfirmationKind::Info,
                request
                    .args
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| "Continue?".to_string()),
            ),
            name => (
                ConfirmationKind::Exec,
                format!("Confirm execution of tool '{name}'?"),
            ),
        };
        ConfirmationDetails {
            kind,
            tool_name: request.name.clone(),
            message,
            args: request.args.clone(),
        }
    }

    async fn request_approval(
        &self,
        request: &ToolCallRequest,
        details: ConfirmationDetails,
    ) -> ConfirmationOutcome {
        let rx = self.broker.register(&request.call_id);
        let _guard = PendingGuard {
            broker: &self.broker,
            call_id: &request.call_id,
        };

        let event = StreamEvent::ToolConfirmationRequest {
            id: request.call_id.clone(),
            name: request.name.clone(),
            args: request.args.clone(),
            kind: details.kind,
            message: details.message,
        };
        if self.events.send(event).is_err() {
            tracing::warn!(call_id = %request.call_id, "no listener for confirmation request");
            return ConfirmationOutcome::Cancel;
        }

        let outcome = rx.await.unwrap_or(ConfirmationOutcome::Cancel);
        if outcome == ConfirmationOutcome::ProceedAlways {
            lock(&self.always_allowed).insert(request.name.clone());
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::tool::ToolArgs;

    fn request(name: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: format!("chat#0-{name}"),
            name: name.into(),
            args: ToolArgs::new(),
            prompt_id: "chat#0".into(),
        }
    }

    fn gate() -> (
        ChatApprovalGate,
        Arc<ApprovalBroker>,
        mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let broker = Arc::new(ApprovalBroker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = ChatApprovalGate::new(
            broker.clone(),
            vec!["write_file".into(), "run_shell_command".into()],
            Arc::new(Mutex::new(HashSet::new())),
            tx,
        );
        (gate, broker, rx)
    }

    #[test]
    fn resolving_unknown_call_is_reported() {
        let broker = ApprovalBroker::new();
        assert!(!broker.resolve("nope", ConfirmationOutcome::ProceedOnce));
    }

    #[test]
    fn write_file_asks_for_an_edit_confirmation() {
        let (gate, _, _) = gate();
        let details = gate.confirmation_details(&request("write_file"));
        assert_eq!(details.kind, ConfirmationKind::Edit);
        assert_eq!(details.message, "Apply this change?");
        assert!(!gate.requires_approval(&request("read_file")));
    }

    #[tokio::test]
    async fn proceed_always_is_remembered_per_tool() {
        let (gate, broker, mut events) = gate();
        let req = request("run_shell_command");
        assert!(gate.requires_approval(&req));

        let waiting = gate.request_approval(&req, gate.confirmation_details(&req));
        let answer = async {
            match events.recv().await {
                Some(StreamEvent::ToolConfirmationRequest { id, kind, message, .. }) => {
                    assert_eq!(kind, ConfirmationKind::Exec);
                    assert_eq!(message, "Confirm execution of tool 'run_shell_command'?");
                    assert!(broker.resolve(&id, ConfirmationOutcome::ProceedAlways));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        };
        let (outcome, ()) = tokio::join!(waiting, answer);

        assert_eq!(outcome, ConfirmationOutcome::ProceedAlways);
        assert!(!gate.requires_approval(&req));
        assert!(gate.requires_approval(&request("write_file")));
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn abandoned_wait_clears_pending_entry() {
        let (gate, broker, _events) = gate();
        let req = request("write_file");
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            gate.request_approval(&req, gate.confirmation_details(&req)),
        )
        .await;
        assert!(result.is_err());
        assert!(broker.pending().is_empty());
    }
}
