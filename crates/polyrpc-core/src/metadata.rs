//! Bidirectional message metadata: wire identifier <-> message type.

use std::any::TypeId;
use std::collections::HashMap;

use tracing::debug;

use crate::contract::{MessageCodec, Operation};
use crate::error::{MetadataError, MetadataResult};
use crate::format::Formatter;
use crate::message::{Header, MessageId, MessageInfo};

const WHAT: &str = "message metadata";

struct Tables<F> {
    by_id: HashMap<MessageId, MessageCodec<F>>,
    by_type: HashMap<TypeId, MessageId>,
}

/// Maps every request, response and header type to its wire identifier.
///
/// Built exactly once; immutable afterwards and safe to share across sessions.
pub struct MessageMetadata<F> {
    tables: Option<Tables<F>>,
}

impl<F: Formatter> Default for MessageMetadata<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Formatter> MessageMetadata<F> {
    /// Creates unbuilt metadata; every lookup fails until [`build`](Self::build).
    pub fn new() -> Self {
        Self { tables: None }
    }

    /// Whether `build` has completed.
    pub fn is_built(&self) -> bool {
        self.tables.is_some()
    }

    /// Registers the messages of every operation plus the header type.
    pub fn build(&mut self, operations: &[Operation<F>]) -> MetadataResult<()> {
        if self.tables.is_some() {
            return Err(MetadataError::AlreadyBuilt { what: WHAT });
        }
        if operations.is_empty() {
            return Err(MetadataError::Empty { what: WHAT });
        }

        let mut tables = Tables {
            by_id: HashMap::new(),
            by_type: HashMap::new(),
        };
        insert(&mut tables, MessageCodec::of::<Header>())?;
        for operation in operations {
            insert(&mut tables, operation.request)?;
            insert(&mut tables, operation.response)?;
        }

        debug!(messages = tables.by_id.len(), "Built message metadata");
        self.tables = Some(tables);
        Ok(())
    }

    /// Returns the message type registered under `id`.
    pub fn type_for(&self, id: MessageId) -> MetadataResult<&MessageInfo> {
        self.codec(id).map(|codec| &codec.info)
    }

    /// Returns the identifier registered for a type.
    pub fn id_for(&self, type_id: TypeId) -> MetadataResult<MessageId> {
        self.tables()?
            .by_type
            .get(&type_id)
            .copied()
            .ok_or_else(|| MetadataError::MissingType {
                type_name: format!("{type_id:?}"),
            })
    }

    /// Returns the identifier registered for `T`.
    pub fn id_of<T: 'static>(&self) -> MetadataResult<MessageId> {
        self.id_for(TypeId::of::<T>())
            .map_err(|err| match err {
                MetadataError::MissingType { .. } => MetadataError::MissingType {
                    type_name: std::any::type_name::<T>().to_string(),
                },
                other => other,
            })
    }

    /// Returns the codec registered under `id`.
    pub fn codec(&self, id: MessageId) -> MetadataResult<&MessageCodec<F>> {
        self.tables()?
            .by_id
            .get(&id)
            .ok_or(MetadataError::MissingId { id })
    }

    /// Returns the codec registered for a type.
    pub fn codec_for(&self, type_id: TypeId) -> MetadataResult<&MessageCodec<F>> {
        let id = self.id_for(type_id)?;
        self.codec(id)
    }

    /// Number of registered message types, header included.
    pub fn len(&self) -> usize {
        self.tables.as_ref().map_or(0, |t| t.by_id.len())
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tables(&self) -> MetadataResult<&Tables<F>> {
        self.tables
            .as_ref()
            .ok_or(MetadataError::NotBuilt { what: WHAT })
    }
}

fn insert<F>(tables: &mut Tables<F>, codec: MessageCodec<F>) -> MetadataResult<()> {
    let info = codec.info;
    if let Some(existing) = tables.by_id.get(&info.id) {
        if existing.info.type_id != info.type_id {
            return Err(MetadataError::Collision {
                id: info.id,
                first: existing.info.type_name,
                second: info.type_name,
            });
        }
        return Ok(());
    }
    tables.by_id.insert(info.id, codec);
    tables.by_type.insert(info.type_id, info.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::inspect;
    use crate::contract::tests::{Echo, EchoReply, EchoRequest, Shout};
    use crate::format::JsonFormatter;
    use crate::message::HEADER_ID;

    fn built() -> MessageMetadata<JsonFormatter> {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let mut metadata = MessageMetadata::new();
        metadata.build(&operations).unwrap();
        metadata
    }

    #[test]
    fn roundtrip_every_registered_type() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let metadata = built();

        for operation in &operations {
            for info in [operation.request.info, operation.response.info] {
                let id = metadata.id_for(info.type_id).unwrap();
                assert_eq!(metadata.type_for(id).unwrap().type_id, info.type_id);
                assert_eq!(metadata.id_for(metadata.type_for(info.id).unwrap().type_id).unwrap(), info.id);
            }
        }
        // header + EchoRequest + Shout + EchoReply
        assert_eq!(metadata.len(), 4);
        assert_eq!(metadata.id_of::<Header>().unwrap(), HEADER_ID);
        assert_eq!(metadata.id_of::<EchoRequest>().unwrap(), 10);
        assert_eq!(metadata.id_of::<EchoReply>().unwrap(), 11);
        assert!(metadata.id_of::<Shout>().is_ok());
    }

    #[test]
    fn build_twice_fails() {
        let operations = inspect::<Echo, JsonFormatter>().unwrap();
        let mut metadata = built();
        let err = metadata.build(&operations).unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyBuilt { .. }));
    }

    #[test]
    fn build_empty_fails() {
        let mut metadata = MessageMetadata::<JsonFormatter>::new();
        let err = metadata.build(&[]).unwrap_err();
        assert!(matches!(err, MetadataError::Empty { .. }));
        assert!(!metadata.is_built());
    }

    #[test]
    fn lookup_before_build_fails() {
        let metadata = MessageMetadata::<JsonFormatter>::new();
        assert!(matches!(
            metadata.type_for(10),
            Err(MetadataError::NotBuilt { .. })
        ));
        assert!(matches!(
            metadata.id_of::<EchoRequest>(),
            Err(MetadataError::NotBuilt { .. })
        ));
    }

    #[test]
    fn unknown_lookups_are_missing_metadata() {
        let metadata = built();
        assert!(matches!(
            metadata.type_for(999),
            Err(MetadataError::MissingId { id: 999 })
        ));
        let err = metadata.id_of::<String>().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"missing metadata for message type alloc::string::String");
    }
}
