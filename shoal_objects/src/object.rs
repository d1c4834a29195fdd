//! User object: attribute name to element handle, plus a type-identity
//! string naming a host-language class.
//!
//! The core only stores attribute state — methods are bound externally
//! by the host. Attribute storage is delegated entirely to [`Map`]; the
//! object's own payload is just the two handles that locate its type
//! name and its attribute map, fixed at creation and never rewritten,
//! so it can be frozen like a scalar while its attributes stay mutable
//! through the inner map's own transactional handle.

use shoal_shm::{Handle, ObjectTag, Segment};
use shoal_txn::{Engine, TransactionContext};

use crate::error::ObjectsResult;
use crate::map::Map;
use crate::value::{new_value, read_value, ScalarValue};

const META_SIZE: usize = 16;

/// A user-defined object: a type name plus an attribute map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShoalObject(pub Handle);

impl ShoalObject {
    /// Allocate a new object of `type_name`, with no attributes set.
    /// Increfs the type-name scalar and the attribute map — both are
    /// stored permanently into this object's own frozen payload.
    pub fn new(engine: &Engine, ctx: &mut TransactionContext, type_name: &str) -> ObjectsResult<Self> {
        let type_handle = new_value(engine, &ScalarValue::Str(type_name.to_string()))?;
        let map = Map::new(ctx)?;

        let mut meta = Vec::with_capacity(META_SIZE);
        meta.extend_from_slice(&type_handle.raw().to_le_bytes());
        meta.extend_from_slice(&map.handle().raw().to_le_bytes());
        let handle = engine.alloc(ObjectTag::Object, &meta, true)?;
        engine.segment().header(type_handle).incref();
        engine.segment().header(map.handle()).incref();
        Ok(ShoalObject(handle))
    }

    /// Wrap an already-allocated object handle.
    pub fn from_handle(handle: Handle) -> Self {
        ShoalObject(handle)
    }

    /// This object's handle.
    pub fn handle(&self) -> Handle {
        self.0
    }

    fn type_and_map_handle(&self, segment: &Segment) -> (Handle, Handle) {
        let bytes = segment.payload(self.0);
        let type_handle = Handle::from_raw(u64::from_le_bytes(bytes[0..8].try_into().unwrap()));
        let map_handle = Handle::from_raw(u64::from_le_bytes(bytes[8..16].try_into().unwrap()));
        (type_handle, map_handle)
    }

    /// The host-language class name recorded at creation.
    pub fn type_name(&self, segment: &Segment) -> ObjectsResult<String> {
        let (type_handle, _map_handle) = self.type_and_map_handle(segment);
        match read_value(segment, type_handle)? {
            ScalarValue::Str(s) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    fn attributes(&self, ctx: &mut TransactionContext) -> Map {
        let (_type_handle, map_handle) = self.type_and_map_handle(ctx.segment());
        Map::from_handle(map_handle)
    }

    /// Read attribute `name`, if set.
    pub fn get(&self, ctx: &mut TransactionContext, name: &str) -> ObjectsResult<Handle> {
        self.attributes(ctx).get(ctx, name)
    }

    /// Whether attribute `name` is set.
    pub fn contains(&self, ctx: &mut TransactionContext, name: &str) -> ObjectsResult<bool> {
        self.attributes(ctx).contains(ctx, name)
    }

    /// Set attribute `name` to `value`. Refcounting is handled by the
    /// inner [`Map::put`] this delegates to.
    pub fn put(&self, engine: &Engine, ctx: &mut TransactionContext, name: &str, value: Handle) -> ObjectsResult<()> {
        self.attributes(ctx).put(engine, ctx, name, value)
    }

    /// Remove attribute `name`.
    pub fn delete(&self, ctx: &mut TransactionContext, name: &str) -> ObjectsResult<Handle> {
        self.attributes(ctx).delete(ctx, name)
    }

    /// Every attribute name currently set.
    pub fn attribute_names(&self, ctx: &mut TransactionContext) -> ObjectsResult<Vec<String>> {
        self.attributes(ctx).iter_keys(ctx)
    }
}
