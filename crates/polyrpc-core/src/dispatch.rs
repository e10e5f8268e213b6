//! Request dispatch.

use std::time::Instant;

use tracing::{debug, warn};

use crate::contract::{Implementor, Operation};
use crate::error::DispatchResult;
use crate::message::AnyMessage;

/// Invokes operation handlers on resolved implementors.
///
/// The typed adapter of each operation is created once, when its contract is
/// inspected; dispatching only calls through it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher;

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new() -> Self {
        Self
    }

    /// Runs `operation` on `implementor` and returns the boxed response.
    ///
    /// Handler errors are returned unchanged.
    pub async fn dispatch<F>(
        &self,
        implementor: Implementor,
        request: AnyMessage,
        operation: &Operation<F>,
    ) -> DispatchResult<AnyMessage> {
        let start = Instant::now();
        let result = operation.invoke(implementor, request).await;
        match &result {
            Ok(_) => debug!(
                operation = operation.name,
                contract = operation.contract.name,
                elapsed_us = start.elapsed().as_micros() as u64,
                "Dispatched request"
            ),
            Err(e) => warn!(
                operation = operation.name,
                contract = operation.contract.name,
                error = %e,
                "Dispatch failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::contract::tests::{Echo, EchoReply, EchoRequest, Shout};
    use crate::contract::{Contract, OperationSet, inspect};
    use crate::error::{BoxError, DispatchError};
    use crate::format::{Formatter, JsonFormatter};

    #[tokio::test]
    async fn dispatches_to_typed_handler() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let implementor: Implementor = Arc::new(Echo::default());

        let response = Dispatcher::new()
            .dispatch(
                implementor,
                Box::new(Shout {
                    text: "hello".into(),
                }),
                &operations[1],
            )
            .await
            .unwrap();

        let reply = response.downcast::<EchoReply>().unwrap();
        assert_eq!(reply.text, "HELLO");
    }

    #[tokio::test]
    async fn rejects_wrong_implementor() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let implementor: Implementor = Arc::new(42u32);

        let err = Dispatcher::new()
            .dispatch(
                implementor,
                Box::new(EchoRequest { text: "x".into() }),
                &operations[0],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ImplementorMismatch { expected: "echo" }));
    }

    #[tokio::test]
    async fn rejects_wrong_request() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let implementor: Implementor = Arc::new(Echo::default());

        let err = Dispatcher::new()
            .dispatch(implementor, Box::new(7u8), &operations[0])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RequestMismatch { .. }));
    }

    struct Failing;

    impl Contract for Failing {
        const NAME: &'static str = "failing";

        fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
            ops.add("fail", |_: Arc<Self>, _: EchoRequest| async move {
                Err::<EchoReply, BoxError>("boom".into())
            });
        }
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let operations = inspect::<Failing, JsonFormatter>().unwrap();
        let err = Dispatcher::new()
            .dispatch(
                Arc::new(Failing),
                Box::new(EchoRequest { text: "x".into() }),
                &operations[0],
            )
            .await
            .unwrap_err();
        match err {
            DispatchError::Handler { operation, source } => {
                assert_eq!(operation, "fail");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
