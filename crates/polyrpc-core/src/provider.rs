//! Per-session implementor resolution.
//!
//! Implementations are registered once as factories in an
//! [`ImplementorRegistry`]. Each session owns an [`ImplementorProvider`] that
//! opens one scope per request, creates the implementor inside it, injects
//! the session's [`Connection`] and drops the instance when the scope closes.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::connection::Connection;
use crate::contract::{Contract, ContractInfo, Implementor};
use crate::error::{ProviderError, ProviderResult};

type Factory = Arc<dyn Fn(&Connection) -> Implementor + Send + Sync>;

/// Factories for contract implementations, keyed by contract type.
#[derive(Clone, Default)]
pub struct ImplementorRegistry {
    factories: HashMap<TypeId, Factory>,
}

impl std::fmt::Debug for ImplementorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementorRegistry")
            .field("contracts", &self.factories.len())
            .finish()
    }
}

impl ImplementorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory producing a fresh `C` for every request.
    ///
    /// Replaces any earlier factory for `C`.
    pub fn register<C, G>(&mut self, factory: G)
    where
        C: Contract,
        G: Fn() -> C + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |connection: &Connection| {
            let mut instance = factory();
            instance.attach_connection(connection);
            Arc::new(instance) as Implementor
        });
        self.factories.insert(TypeId::of::<C>(), factory);
    }

    /// Whether a factory exists for the contract.
    pub fn contains(&self, contract: &ContractInfo) -> bool {
        self.factories.contains_key(&contract.type_id)
    }

    fn create(&self, contract: &ContractInfo, connection: &Connection) -> ProviderResult<Implementor> {
        let factory = self
            .factories
            .get(&contract.type_id)
            .ok_or(ProviderError::NotRegistered {
                contract: contract.name,
            })?;
        Ok(factory(connection))
    }
}

/// Resolves and releases implementors for one session.
pub struct ImplementorProvider {
    registry: Arc<ImplementorRegistry>,
    connection: Option<Connection>,
    scope: Option<Vec<Implementor>>,
}

impl ImplementorProvider {
    /// Creates a provider drawing from `registry`.
    pub fn new(registry: Arc<ImplementorRegistry>) -> Self {
        Self {
            registry,
            connection: None,
            scope: None,
        }
    }

    /// Binds the session's connection for later injection.
    pub fn session_started(&mut self, connection: &Connection) {
        self.connection = Some(connection.clone());
    }

    /// Opens the scope of a new operation.
    pub fn operation_started(&mut self) -> ProviderResult<()> {
        if self.scope.is_some() {
            return Err(ProviderError::ScopeAlreadyOpen);
        }
        self.scope = Some(Vec::new());
        Ok(())
    }

    /// Creates an implementor of `contract` inside the open scope.
    pub fn resolve(&mut self, contract: &ContractInfo) -> ProviderResult<Implementor> {
        let connection = self.connection.as_ref().ok_or(ProviderError::NoSession)?;
        let scope = self.scope.as_mut().ok_or(ProviderError::NoScope)?;
        let implementor = self.registry.create(contract, connection)?;
        scope.push(Arc::clone(&implementor));
        trace!(contract = contract.name, "Resolved implementor");
        Ok(implementor)
    }

    /// Closes the current scope, releasing every instance it resolved.
    pub fn operation_finished(&mut self) -> ProviderResult<()> {
        let scope = self.scope.take().ok_or(ProviderError::NoScope)?;
        trace!(released = scope.len(), "Operation scope closed");
        Ok(())
    }

    /// Whether an operation scope is open.
    pub fn in_operation(&self) -> bool {
        self.scope.is_some()
    }

    /// Releases the scope and the bound connection.
    pub fn dispose(&mut self) {
        self.scope = None;
        self.connection = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::connection::Address;
    use crate::contract::tests::Echo;
    use crate::contract::OperationSet;
    use crate::format::Formatter;

    fn opened() -> Connection {
        let mut conn = Connection::new();
        conn.open(
            Address::Memory("server".into()),
            Address::Memory("client".into()),
        )
        .unwrap();
        conn
    }

    fn provider() -> ImplementorProvider {
        let mut registry = ImplementorRegistry::new();
        registry.register(Echo::default);
        let mut provider = ImplementorProvider::new(Arc::new(registry));
        provider.session_started(&opened());
        provider
    }

    #[test]
    fn resolves_inside_scope_and_injects_connection() {
        let mut provider = provider();
        provider.operation_started().unwrap();

        let implementor = provider.resolve(&ContractInfo::of::<Echo>()).unwrap();
        let echo = implementor.downcast::<Echo>().unwrap();
        assert_eq!(echo.remote.as_deref(), Some("memory://client"));

        provider.operation_finished().unwrap();
        assert!(!provider.in_operation());
    }

    #[test]
    fn overlapping_scopes_are_rejected() {
        let mut provider = provider();
        provider.operation_started().unwrap();
        assert!(matches!(
            provider.operation_started(),
            Err(ProviderError::ScopeAlreadyOpen)
        ));
    }

    #[test]
    fn resolve_requires_scope_and_session() {
        let mut provider = provider();
        assert!(matches!(
            provider.resolve(&ContractInfo::of::<Echo>()),
            Err(ProviderError::NoScope)
        ));

        let mut unbound = ImplementorProvider::new(Arc::new(ImplementorRegistry::new()));
        unbound.operation_started().unwrap();
        assert!(matches!(
            unbound.resolve(&ContractInfo::of::<Echo>()),
            Err(ProviderError::NoSession)
        ));
    }

    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPPED.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Contract for Tracked {
        const NAME: &'static str = "tracked";
        fn describe<F: Formatter>(_ops: &mut OperationSet<Self, F>) {}
    }

    #[test]
    fn finishing_scope_releases_instances() {
        let mut registry = ImplementorRegistry::new();
        registry.register(|| Tracked);
        let mut provider = ImplementorProvider::new(Arc::new(registry));
        provider.session_started(&opened());

        provider.operation_started().unwrap();
        let instance = provider.resolve(&ContractInfo::of::<Tracked>()).unwrap();
        drop(instance);
        assert_eq!(DROPPED.load(Ordering::SeqCst), 0);

        provider.operation_finished().unwrap();
        assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_contract() {
        let mut provider = ImplementorProvider::new(Arc::new(ImplementorRegistry::new()));
        provider.session_started(&opened());
        provider.operation_started().unwrap();
        assert!(matches!(
            provider.resolve(&ContractInfo::of::<Echo>()),
            Err(ProviderError::NotRegistered { contract: "echo" })
        ));
    }
}
