//! Contracts, operations and the contract inspector.
//!
//! A contract is a type implementing [`Contract`]. Its [`Contract::describe`]
//! registers one handler per operation on an [`OperationSet`]; each handler
//! takes exactly one request message and resolves to one response message.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use polyrpc_core::{BoxError, Contract, Formatter, Message, OperationSet};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Add { a: i64, b: i64 }
//! impl Message for Add { const NAME: &'static str = "calc.Add"; }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Sum { value: i64 }
//! impl Message for Sum { const NAME: &'static str = "calc.Sum"; }
//!
//! struct Calculator;
//!
//! impl Contract for Calculator {
//!     const NAME: &'static str = "calc";
//!
//!     fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
//!         ops.add("add", |_calc: Arc<Self>, req: Add| async move {
//!             Ok::<_, BoxError>(Sum { value: req.a + req.b })
//!         });
//!     }
//! }
//!
//! let operations = polyrpc_core::inspect::<Calculator, polyrpc_core::JsonFormatter>().unwrap();
//! assert_eq!(operations.len(), 1);
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{
    BoxError, ContractError, ContractResult, DispatchError, FormatError, FormatResult, Violation,
};
use crate::format::Formatter;
use crate::message::{AnyMessage, HEADER_ID, Header, Message, MessageId, MessageInfo};

/// A shared, type-erased implementor instance.
pub type Implementor = Arc<dyn Any + Send + Sync>;

/// Future produced by an operation handler adapter.
pub type HandlerFuture = BoxFuture<'static, Result<AnyMessage, DispatchError>>;

type HandlerFn = dyn Fn(Implementor, AnyMessage) -> HandlerFuture + Send + Sync;

/// A set of request/response operations exposed by a service.
pub trait Contract: Send + Sync + Sized + 'static {
    /// Contract name, used in diagnostics.
    const NAME: &'static str;

    /// Registers the contract's operations.
    fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>);

    /// Receives the connection the current request arrived on.
    ///
    /// Called once per resolved instance, before the handler runs.
    fn attach_connection(&mut self, _connection: &Connection) {}
}

/// Identity of a contract type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractInfo {
    /// Rust type identity of the contract.
    pub type_id: TypeId,
    /// Declared contract name.
    pub name: &'static str,
}

impl ContractInfo {
    /// Describes `C`.
    pub fn of<C: Contract>() -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            name: C::NAME,
        }
    }
}

/// Per-type encode/decode adapters, monomorphized for one formatter.
pub struct MessageCodec<F> {
    /// The message type this codec handles.
    pub info: MessageInfo,
    encode: fn(&mut F, &(dyn Any + Send), &mut Vec<u8>) -> FormatResult<()>,
    decode: fn(&mut F, &[u8]) -> FormatResult<AnyMessage>,
}

impl<F> Clone for MessageCodec<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for MessageCodec<F> {}

impl<F: Formatter> MessageCodec<F> {
    /// Builds the codec for `M`.
    pub fn of<M: Message>() -> Self {
        Self {
            info: MessageInfo::of::<M>(),
            encode: encode_erased::<F, M>,
            decode: decode_erased::<F, M>,
        }
    }

    /// Serializes `value`, which must be of this codec's type.
    pub fn encode(
        &self,
        formatter: &mut F,
        value: &(dyn Any + Send),
        out: &mut Vec<u8>,
    ) -> FormatResult<()> {
        (self.encode)(formatter, value, out)
    }

    /// Deserializes one message of this codec's type.
    pub fn decode(&self, formatter: &mut F, bytes: &[u8]) -> FormatResult<AnyMessage> {
        (self.decode)(formatter, bytes)
    }
}

fn encode_erased<F: Formatter, M: Message>(
    formatter: &mut F,
    value: &(dyn Any + Send),
    out: &mut Vec<u8>,
) -> FormatResult<()> {
    let value = value
        .downcast_ref::<M>()
        .ok_or(FormatError::TypeMismatch {
            expected: std::any::type_name::<M>(),
        })?;
    formatter.serialize(value, out)
}

fn decode_erased<F: Formatter, M: Message>(
    formatter: &mut F,
    bytes: &[u8],
) -> FormatResult<AnyMessage> {
    let value: M = formatter.deserialize(bytes)?;
    Ok(Box::new(value))
}

/// Static description of one contract operation.
pub struct Operation<F> {
    /// Operation name.
    pub name: &'static str,
    /// Owning contract.
    pub contract: ContractInfo,
    /// Request message codec.
    pub request: MessageCodec<F>,
    /// Response message codec.
    pub response: MessageCodec<F>,
    handler: Arc<HandlerFn>,
}

impl<F> Clone for Operation<F> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            contract: self.contract,
            request: self.request,
            response: self.response,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<F> std::fmt::Debug for Operation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("contract", &self.contract.name)
            .field("request", &self.request.info)
            .field("response", &self.response.info)
            .finish()
    }
}

impl<F> Operation<F> {
    /// Request wire identifier.
    pub fn request_id(&self) -> MessageId {
        self.request.info.id
    }

    /// Response wire identifier.
    pub fn response_id(&self) -> MessageId {
        self.response.info.id
    }

    /// Runs the handler adapter on an implementor.
    pub fn invoke(&self, implementor: Implementor, request: AnyMessage) -> HandlerFuture {
        (self.handler)(implementor, request)
    }
}

/// Collects the operations of contract `C` during [`Contract::describe`].
pub struct OperationSet<C, F> {
    contract: ContractInfo,
    operations: Vec<Operation<F>>,
    _contract: PhantomData<fn() -> C>,
}

impl<C: Contract, F: Formatter> OperationSet<C, F> {
    fn new() -> Self {
        Self {
            contract: ContractInfo::of::<C>(),
            operations: Vec::new(),
            _contract: PhantomData,
        }
    }

    /// Registers an operation handling `Req` and answering with `Resp`.
    pub fn add<Req, Resp, H, Fut, E>(&mut self, name: &'static str, handler: H) -> &mut Self
    where
        Req: Message,
        Resp: Message,
        H: Fn(Arc<C>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let adapter = move |implementor: Implementor, request: AnyMessage| -> HandlerFuture {
            let implementor = match implementor.downcast::<C>() {
                Ok(implementor) => implementor,
                Err(_) => {
                    return futures_util::future::ready(Err(DispatchError::ImplementorMismatch {
                        expected: C::NAME,
                    }))
                    .boxed();
                }
            };
            let request = match request.downcast::<Req>() {
                Ok(request) => *request,
                Err(_) => {
                    return futures_util::future::ready(Err(DispatchError::RequestMismatch {
                        expected: std::any::type_name::<Req>(),
                    }))
                    .boxed();
                }
            };
            handler(implementor, request)
                .map(move |result| match result {
                    Ok(response) => Ok(Box::new(response) as AnyMessage),
                    Err(err) => Err(DispatchError::Handler {
                        operation: name,
                        source: err.into(),
                    }),
                })
                .boxed()
        };

        self.operations.push(Operation {
            name,
            contract: self.contract,
            request: MessageCodec::of::<Req>(),
            response: MessageCodec::of::<Resp>(),
            handler: Arc::new(adapter),
        });
        self
    }
}

/// Inspects contract `C` and returns its validated operations.
///
/// All violations are collected before failing.
pub fn inspect<C: Contract, F: Formatter>() -> ContractResult<Vec<Operation<F>>> {
    let mut set = OperationSet::<C, F>::new();
    C::describe(&mut set);
    let operations = set.operations;

    let mut violations = Vec::new();
    if operations.is_empty() {
        violations.push(Violation::NoOperations);
    }

    let mut ids: HashMap<MessageId, MessageInfo> = HashMap::new();
    ids.insert(HEADER_ID, MessageInfo::of::<Header>());
    let mut requests: HashMap<TypeId, &'static str> = HashMap::new();

    for operation in &operations {
        for info in [operation.request.info, operation.response.info] {
            if !info.is_identified() {
                push_unique(
                    &mut violations,
                    Violation::MissingIdentification {
                        type_name: info.type_name,
                    },
                );
                continue;
            }
            match ids.entry(info.id) {
                Entry::Vacant(slot) => {
                    slot.insert(info);
                }
                Entry::Occupied(slot) if slot.get().type_id != info.type_id => {
                    push_unique(
                        &mut violations,
                        Violation::IdCollision {
                            id: info.id,
                            first: slot.get().type_name,
                            second: info.type_name,
                        },
                    );
                }
                Entry::Occupied(_) => {}
            }
        }

        match requests.entry(operation.request.info.type_id) {
            Entry::Vacant(slot) => {
                slot.insert(operation.name);
            }
            Entry::Occupied(slot) => violations.push(Violation::AmbiguousRequest {
                request: operation.request.info.type_name,
                first: slot.get(),
                second: operation.name,
            }),
        }
    }

    if !violations.is_empty() {
        return Err(ContractError::Invalid {
            contract: C::NAME,
            violations,
        });
    }

    debug!(
        contract = C::NAME,
        operations = operations.len(),
        "Inspected contract"
    );
    Ok(operations)
}

fn push_unique(violations: &mut Vec<Violation>, violation: Violation) {
    if !violations.contains(&violation) {
        violations.push(violation);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::format::JsonFormatter;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EchoRequest {
        pub text: String,
    }
    impl Message for EchoRequest {
        const NAME: &'static str = "tests.EchoRequest";
        const ID: Option<MessageId> = Some(10);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EchoReply {
        pub text: String,
    }
    impl Message for EchoReply {
        const NAME: &'static str = "tests.EchoReply";
        const ID: Option<MessageId> = Some(11);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Shout {
        pub text: String,
    }
    impl Message for Shout {
        const NAME: &'static str = "tests.Shout";
    }

    #[derive(Default)]
    pub struct Echo {
        pub remote: Option<String>,
    }

    impl Contract for Echo {
        const NAME: &'static str = "echo";

        fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
            ops.add("echo", |_svc: Arc<Self>, req: EchoRequest| async move {
                Ok::<_, BoxError>(EchoReply { text: req.text })
            })
            .add("shout", |_svc: Arc<Self>, req: Shout| async move {
                Ok::<_, BoxError>(EchoReply {
                    text: req.text.to_uppercase(),
                })
            });
        }

        fn attach_connection(&mut self, connection: &Connection) {
            self.remote = connection.remote_address().ok().map(ToString::to_string);
        }
    }

    struct Empty;
    impl Contract for Empty {
        const NAME: &'static str = "empty";
        fn describe<F: Formatter>(_ops: &mut OperationSet<Self, F>) {}
    }

    #[derive(Serialize, Deserialize)]
    struct Nameless;
    impl Message for Nameless {
        const NAME: &'static str = "";
    }

    #[derive(Serialize, Deserialize)]
    struct ClaimsTen;
    impl Message for ClaimsTen {
        const NAME: &'static str = "tests.ClaimsTen";
        const ID: Option<MessageId> = Some(10);
    }

    #[derive(Serialize, Deserialize)]
    struct ClaimsHeader;
    impl Message for ClaimsHeader {
        const NAME: &'static str = "tests.ClaimsHeader";
        const ID: Option<MessageId> = Some(HEADER_ID);
    }

    struct Broken;
    impl Contract for Broken {
        const NAME: &'static str = "broken";

        fn describe<F: Formatter>(ops: &mut OperationSet<Self, F>) {
            ops.add("nameless", |_: Arc<Self>, _: Nameless| async move {
                Ok::<_, BoxError>(EchoReply { text: String::new() })
            })
            .add("collide", |_: Arc<Self>, _: ClaimsTen| async move {
                Ok::<_, BoxError>(EchoReply { text: String::new() })
            })
            .add("first", |_: Arc<Self>, _: EchoRequest| async move {
                Ok::<_, BoxError>(EchoReply { text: String::new() })
            })
            .add("second", |_: Arc<Self>, _: EchoRequest| async move {
                Ok::<_, BoxError>(EchoReply { text: String::new() })
            })
            .add("header", |_: Arc<Self>, _: ClaimsHeader| async move {
                Ok::<_, BoxError>(EchoReply { text: String::new() })
            });
        }
    }

    #[test]
    fn inspects_valid_contract() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        assert_eq!(operations.len(), 2);

        let echo = &operations[0];
        assert_eq!(echo.name, "echo");
        assert_eq!(echo.request_id(), 10);
        assert_eq!(echo.response_id(), 11);
        assert_eq!(echo.contract, ContractInfo::of::<Echo>());

        let shout = &operations[1];
        assert_eq!(shout.request_id(), crate::derive_message_id("tests.Shout"));
    }

    #[test]
    fn empty_contract_is_rejected() {
        let err = inspect::<Empty, JsonFormatter>().unwrap_err();
        assert_eq!(err.violations(), &[Violation::NoOperations]);
    }

    #[test]
    fn violations_are_aggregated() {
        let err = inspect::<Broken, JsonFormatter>().unwrap_err();
        let violations = err.violations();

        assert!(violations.contains(&Violation::MissingIdentification {
            type_name: std::any::type_name::<Nameless>(),
        }));
        assert!(violations.contains(&Violation::IdCollision {
            id: 10,
            first: std::any::type_name::<ClaimsTen>(),
            second: std::any::type_name::<EchoRequest>(),
        }));
        assert!(violations.contains(&Violation::AmbiguousRequest {
            request: std::any::type_name::<EchoRequest>(),
            first: "first",
            second: "second",
        }));
        assert!(violations.contains(&Violation::IdCollision {
            id: HEADER_ID,
            first: std::any::type_name::<Header>(),
            second: std::any::type_name::<ClaimsHeader>(),
        }));
        // The repeated EchoRequest/ClaimsTen clash is reported once.
        let collisions = violations
            .iter()
            .filter(|v| matches!(v, Violation::IdCollision { id: 10, .. }))
            .count();
        assert_eq!(collisions, 1);
    }

    #[test]
    fn codec_roundtrip_through_erased_values() {
        let codec = MessageCodec::<JsonFormatter>::of::<EchoRequest>();
        let mut formatter = JsonFormatter;
        let mut out = Vec::new();
        let value = EchoRequest {
            text: "hello".into(),
        };
        codec.encode(&mut formatter, &value, &mut out).unwrap();

        let decoded = codec.decode(&mut formatter, &out).unwrap();
        assert_eq!(decoded.downcast_ref::<EchoRequest>(), Some(&value));
    }

    #[test]
    fn codec_rejects_foreign_type() {
        let codec = MessageCodec::<JsonFormatter>::of::<EchoRequest>();
        let mut out = Vec::new();
        let result = codec.encode(&mut JsonFormatter, &EchoReply { text: "x".into() }, &mut out);
        assert!(matches!(result, Err(FormatError::TypeMismatch { .. })));
    }
}
