//! Invocation router.
//!
//! Calls that want a result register a correlation id before INVOKE is
//! written. The matching INVOKE_RETURN resolves the pending entry; a lost
//! connection rejects all of them.

use crate::error::InvokeError;
use crate::value::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

type InvokeResult = Result<Value, InvokeError>;

/// Pending result of a method call.
#[derive(Debug)]
pub struct Invocation {
    id: String,
    rx: oneshot::Receiver<InvokeResult>,
}

impl Invocation {
    /// Correlation id carried in INVOKE's `return` field.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the result. Someone has to keep driving the connection.
    pub async fn result(self) -> InvokeResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(InvokeError::Cancelled("connection dropped".to_string())))
    }

    /// Returns the result if it has arrived.
    pub fn try_result(&mut self) -> Option<InvokeResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(InvokeError::Cancelled(
                "connection dropped".to_string(),
            ))),
        }
    }
}

/// Pending invocations of one connection.
#[derive(Debug, Default)]
pub struct InvocationRouter {
    pending: HashMap<String, oneshot::Sender<InvokeResult>>,
}

impl InvocationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending invocation under a fresh correlation id.
    pub fn register(&mut self) -> Invocation {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        Invocation { id, rx }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Settles the invocation `id`. Returns false if nothing was waiting.
    pub fn resolve(&mut self, id: &str, result: InvokeResult) -> bool {
        match self.pending.remove(id) {
            Some(tx) => {
                // The caller may have stopped caring.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Rejects every pending invocation.
    pub fn fail_all(&mut self, reason: &str) {
        if !self.pending.is_empty() {
            tracing::debug!("Rejecting {} pending invocations", self.pending.len());
        }
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(InvokeError::Cancelled(reason.to_string())));
        }
    }
}

/// Unwraps a returned value list: nothing is null, one value is itself,
/// several stay an array.
pub fn unwrap_return(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_return() {
        assert_eq!(unwrap_return(vec![]), Value::Null);
        assert_eq!(unwrap_return(vec![Value::Int(1)]), Value::Int(1));
        assert_eq!(
            unwrap_return(vec![Value::Int(1), Value::from("a")]),
            Value::Array(vec![Value::Int(1), Value::from("a")])
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let mut router = InvocationRouter::new();
        let a = router.register();
        let b = router.register();
        assert_ne!(a.id(), b.id());
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_and_reject() {
        let mut router = InvocationRouter::new();
        let mut ok = router.register();
        let err = router.register();
        assert!(ok.try_result().is_none());

        assert!(router.resolve(ok.id(), Ok(Value::Int(1))));
        assert!(!router.resolve(ok.id(), Ok(Value::Int(2))));
        assert_eq!(ok.try_result(), Some(Ok(Value::Int(1))));

        router.resolve(err.id(), Err(InvokeError::Remote("boom".into())));
        assert_eq!(err.result().await, Err(InvokeError::Remote("boom".into())));
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut router = InvocationRouter::new();
        let first = router.register();
        let second = router.register();
        router.fail_all("connection closed");

        assert!(router.is_empty());
        assert_eq!(
            first.result().await,
            Err(InvokeError::Cancelled("connection closed".into()))
        );
        assert!(matches!(second.result().await, Err(InvokeError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_dropped_router_cancels() {
        let mut router = InvocationRouter::new();
        let mut pending = router.register();
        drop(router);
        assert!(matches!(pending.try_result(), Some(Err(InvokeError::Cancelled(_)))));
    }
}
