//! Extension codecs.
//!
//! Types the built-in wire format does not know are handled by
//! [`CodecModule`]s registered in a [`CodecRegistry`]. The registry is an
//! ordered chain: a lookup asks each module in insertion order and the
//! first one that claims the value (or tag) wins. If none does, the lookup
//! fails with [`WireError::NoCodec`].
//!
//! The registry is assembled once at startup with a [`CodecRegistryBuilder`]
//! and shared read-only afterwards (`Arc<CodecRegistry>`).

use std::any::{type_name, Any};
use std::marker::PhantomData;

use crate::wire::{Bytable, Cursor, Decode, Encode, Tagged};
use crate::WireError;

/// A dynamically typed decoded value.
pub type DynValue = Box<dyn Any + Send>;

/// One link in the codec chain.
pub trait CodecModule: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Encodes `value` (including its leading tag) if this module handles
    /// its type.
    fn encode<'a>(&self, value: &'a dyn Any) -> Option<Bytable<'a>>;

    /// Decodes the body that follows `tag` if this module handles it.
    /// The cursor is positioned just after the tag.
    fn decode(&self, tag: u16, cur: &mut Cursor<'_>) -> Option<Result<DynValue, WireError>>;
}

/// A module for a single concrete type with a fixed tag.
pub struct TypedModule<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedModule<T> {
    /// Creates a module named after the type.
    pub fn new() -> Self {
        Self::named(type_name::<T>())
    }

    /// Creates a module with an explicit name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedModule<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CodecModule for TypedModule<T>
where
    T: Encode + Decode + Tagged + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn encode<'a>(&self, value: &'a dyn Any) -> Option<Bytable<'a>> {
        let value = value.downcast_ref::<T>()?;
        Some(Bytable::new(2 + value.encoded_len(), move |w| {
            w.put_u16(T::TAG);
            value.encode(w);
        }))
    }

    fn decode(&self, tag: u16, cur: &mut Cursor<'_>) -> Option<Result<DynValue, WireError>> {
        if tag != T::TAG {
            return None;
        }
        Some(T::decode(cur).map(|v| Box::new(v) as DynValue))
    }
}

/// Collects modules before the registry is frozen.
#[derive(Default)]
pub struct CodecRegistryBuilder {
    modules: Vec<Box<dyn CodecModule>>,
}

impl CodecRegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a module. Earlier modules take priority.
    pub fn module(mut self, module: impl CodecModule) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    /// Appends a [`TypedModule`] for `T`.
    pub fn typed<T>(self) -> Self
    where
        T: Encode + Decode + Tagged + Send + 'static,
    {
        self.module(TypedModule::<T>::new())
    }

    /// Freezes the chain.
    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            modules: self.modules,
        }
    }
}

/// The frozen, read-only chain of codec modules.
#[derive(Default)]
pub struct CodecRegistry {
    modules: Vec<Box<dyn CodecModule>>,
}

impl CodecRegistry {
    /// Starts building a registry.
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::new()
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// `true` when no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Encodes `value` with the first module that accepts it.
    pub fn encode<T: Any>(&self, value: &T) -> Result<Vec<u8>, WireError> {
        self.encode_dyn(value, type_name::<T>())
    }

    fn encode_dyn(&self, value: &dyn Any, type_name: &str) -> Result<Vec<u8>, WireError> {
        self.modules
            .iter()
            .find_map(|m| m.encode(value))
            .map(Bytable::into_vec)
            .ok_or_else(|| WireError::NoCodec(type_name.to_owned()))
    }

    /// Decodes the next tagged value with the first module that claims its
    /// tag. A failed module decode is final; later modules are not tried.
    pub fn decode_dyn(&self, cur: &mut Cursor<'_>) -> Result<DynValue, WireError> {
        let start = cur.position();
        let tag = cur.read::<u16>()?;
        for module in &self.modules {
            if let Some(result) = module.decode(tag, cur) {
                tracing::trace!(module = module.name(), tag, "extension decoded");
                return result;
            }
        }
        cur.seek(start)?;
        Err(WireError::NoCodec(format!("tag {tag:#06x}")))
    }

    /// Decodes the next tagged value and downcasts it to `T`.
    pub fn decode<T: Any>(&self, cur: &mut Cursor<'_>) -> Result<T, WireError> {
        let value = self.decode_dyn(cur)?;
        value.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
            WireError::InvalidValue(format!("decoded value is not a {}", type_name::<T>()))
        })
    }

    /// `true` if some module claims `tag`.
    pub fn handles_tag(&self, tag: u16) -> bool {
        // Probing with an empty cursor: a module that claims the tag answers
        // `Some(Err(Truncated))`, one that does not answers `None`.
        let empty: [u8; 0] = [];
        self.modules
            .iter()
            .any(|m| m.decode(tag, &mut Cursor::new(&empty)).is_some())
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|m| m.name()))
            .finish()
    }
}
