//! Type → transmuter table

use super::{ServiceQueue, Transmuter, transmute};
use crate::error::{Error, Result};
use crate::service::RawPacket;
use crossbeam_channel::Receiver;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static BUILTIN: LazyLock<TransmuterRegistry> = LazyLock::new(TransmuterRegistry::with_builtins);

/// Explicit registry of payload conversions keyed by target type
#[derive(Default)]
pub struct TransmuterRegistry {
    table: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl TransmuterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in conversions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(transmute::bools);
        registry.register(transmute::ints);
        registry.register(transmute::doubles);
        #[cfg(feature = "image")]
        registry.register(transmute::image);
        registry
    }

    /// Shared instance holding the built-ins
    pub fn builtin() -> &'static TransmuterRegistry {
        &BUILTIN
    }

    /// Add or replace the conversion for `T`
    pub fn register<T, F>(&mut self, transmute: F)
    where
        T: 'static,
        F: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        let transmuter: Transmuter<T> = Arc::new(transmute);
        self.table.insert(TypeId::of::<T>(), Box::new(transmuter));
    }

    pub fn supports<T: 'static>(&self) -> bool {
        self.table.contains_key(&TypeId::of::<T>())
    }

    pub fn transmuter<T: 'static>(&self) -> Result<Transmuter<T>> {
        self.table
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<Transmuter<T>>())
            .cloned()
            .ok_or(Error::TransmutationNotSupported(type_name::<T>()))
    }

    /// Typed view over `backing` using the conversion registered for `T`
    pub fn make<T: 'static>(&self, backing: Receiver<RawPacket>) -> Result<ServiceQueue<T>> {
        Ok(ServiceQueue::with_transmuter(backing, self.transmuter::<T>()?))
    }
}
