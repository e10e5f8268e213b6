//! Request identifier -> operation routing.

use std::collections::HashMap;

use tracing::debug;

use crate::contract::Operation;
use crate::error::{MetadataError, MetadataResult};
use crate::message::MessageId;

const WHAT: &str = "router";

/// Chooses the operation that handles a request identifier.
///
/// Same build-once contract as [`MessageMetadata`](crate::MessageMetadata).
pub struct Router<F> {
    routes: Option<HashMap<MessageId, Operation<F>>>,
}

impl<F> Default for Router<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Router<F> {
    /// Creates an unbuilt router.
    pub fn new() -> Self {
        Self { routes: None }
    }

    /// Whether `build` has completed.
    pub fn is_built(&self) -> bool {
        self.routes.is_some()
    }

    /// Builds the routing table from the operation list.
    pub fn build(&mut self, operations: &[Operation<F>]) -> MetadataResult<()> {
        if self.routes.is_some() {
            return Err(MetadataError::AlreadyBuilt { what: WHAT });
        }
        if operations.is_empty() {
            return Err(MetadataError::Empty { what: WHAT });
        }

        let mut routes: HashMap<MessageId, Operation<F>> = HashMap::new();
        for operation in operations {
            if let Some(existing) = routes.get(&operation.request_id()) {
                return Err(MetadataError::Collision {
                    id: operation.request_id(),
                    first: existing.request.info.type_name,
                    second: operation.request.info.type_name,
                });
            }
            routes.insert(operation.request_id(), operation.clone());
        }

        debug!(routes = routes.len(), "Built router");
        self.routes = Some(routes);
        Ok(())
    }

    /// Returns the operation routed for `request_id`.
    pub fn choose(&self, request_id: MessageId) -> MetadataResult<&Operation<F>> {
        self.routes
            .as_ref()
            .ok_or(MetadataError::NotBuilt { what: WHAT })?
            .get(&request_id)
            .ok_or(MetadataError::NoRoute { id: request_id })
    }

    /// Iterates over every routed operation.
    pub fn operations(&self) -> impl Iterator<Item = &Operation<F>> {
        self.routes.iter().flat_map(|routes| routes.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::inspect;
    use crate::contract::tests::Echo;
    use crate::format::JsonFormatter;

    #[test]
    fn chooses_every_operation() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let mut router = Router::new();
        router.build(&operations).unwrap();

        for operation in &operations {
            let chosen = router.choose(operation.request_id()).unwrap();
            assert_eq!(chosen.name, operation.name);
        }
        assert_eq!(router.operations().count(), 2);
    }

    #[test]
    fn unknown_request_is_rejected() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let mut router = Router::new();
        router.build(&operations).unwrap();
        assert!(matches!(
            router.choose(11),
            Err(MetadataError::NoRoute { id: 11 })
        ));
    }

    #[test]
    fn build_once_rules() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let mut router = Router::<JsonFormatter>::new();
        assert!(matches!(router.choose(10), Err(MetadataError::NotBuilt { .. })));
        assert!(matches!(router.build(&[]), Err(MetadataError::Empty { .. })));

        router.build(&operations).unwrap();
        assert!(matches!(
            router.build(&operations),
            Err(MetadataError::AlreadyBuilt { .. })
        ));
    }

    #[test]
    fn duplicate_request_across_contracts_is_rejected() {
        let mut operations = inspect::<Echo, JsonFormatter>().unwrap();
        operations.push(operations[0].clone());
        let mut router = Router::new();
        assert!(matches!(
            router.build(&operations),
            Err(MetadataError::Collision { id: 10, .. })
        ));
    }
}
