use std::collections::HashMap;

use parking_lot::Mutex;

use crate::call::{CallContext, CallId};

/// Live calls keyed by id.
///
/// Removal is compare-and-remove: a caller holding a stale or foreign context cannot evict
/// the registered one, and a second removal of the same call is a no-op.
#[derive(Debug, Default)]
pub(crate) struct ActiveCalls {
    calls: Mutex<HashMap<CallId, CallContext>>,
}

impl ActiveCalls {
    pub fn insert(&self, ctx: CallContext) {
        self.calls.lock().insert(ctx.id(), ctx);
    }

    /// Removes `ctx` if it is the call registered under its id. Returns whether it was removed.
    pub fn remove(&self, ctx: &CallContext) -> bool {
        let mut calls = self.calls.lock();
        match calls.get(&ctx.id()) {
            Some(registered) if registered.same_call(ctx) => {
                calls.remove(&ctx.id());
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<CallContext> {
        self.calls.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::call::{CallParts, CallShape, Peer};
    use crate::rpc::Metadata;

    fn call(id: CallId) -> CallContext {
        let (_inbound_tx, inbound) = mpsc::channel(1);
        let (outbound, _outbound_rx) = mpsc::channel(1);
        CallContext::new(CallParts {
            id,
            stream: 1,
            method: "/svc/M".to_string(),
            shape: CallShape::Unary,
            invocation_metadata: Metadata::new(),
            peer: Peer::default(),
            deadline: None,
            max_message_bytes: 1024,
            inbound,
            outbound,
        })
    }

    #[test]
    fn removes_each_call_exactly_once() {
        let calls = ActiveCalls::default();
        let ctx = call(1);
        calls.insert(ctx.clone());

        assert!(calls.remove(&ctx));
        assert!(!calls.remove(&ctx));
        assert!(calls.is_empty());
    }

    #[test]
    fn stale_context_with_same_id_is_not_removed() {
        let calls = ActiveCalls::default();
        let registered = call(5);
        let impostor = call(5);
        calls.insert(registered.clone());

        assert!(!calls.remove(&impostor));
        assert_eq!(calls.len(), 1);
        assert!(calls.remove(&registered));
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let calls = ActiveCalls::default();
        calls.insert(call(1));
        calls.insert(call(2));

        let snapshot = calls.snapshot();
        for ctx in &snapshot {
            calls.remove(ctx);
        }

        assert_eq!(snapshot.len(), 2);
        assert!(calls.is_empty());
    }
}
