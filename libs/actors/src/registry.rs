//! Behavior registry
//!
//! Name to descriptor table, built before any worker starts and shared
//! read-only (`Arc<Registry>`) by all of them. Routers declared by
//! descriptors are indexed by router name here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{Descriptor, RouterSpec};
use crate::error::{KiteError, Result};

#[derive(Debug, Default)]
pub struct Registry {
    descriptors: HashMap<String, Arc<Descriptor>>,
    routers: HashMap<String, Arc<RouterSpec>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Descriptor for a behavior name
    pub fn descriptor(&self, name: &str) -> Result<&Arc<Descriptor>> {
        self.descriptors
            .get(name)
            .ok_or_else(|| KiteError::lookup(format!("no behavior named {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    pub fn router(&self, name: &str) -> Option<&Arc<RouterSpec>> {
        self.routers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<Result<Descriptor>>,
}

impl RegistryBuilder {
    /// Add a descriptor; a failed build is reported by [`RegistryBuilder::build`]
    pub fn register(mut self, descriptor: Result<Descriptor>) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn build(self) -> Result<Registry> {
        let mut registry = Registry::default();

        for descriptor in self.descriptors {
            let descriptor = Arc::new(descriptor?);

            if let Some(router) = &descriptor.router {
                if registry.routers.contains_key(&router.name) {
                    return Err(KiteError::boot(format!("router {} declared twice", router.name)));
                }
                registry.routers.insert(router.name.clone(), router.clone());
            }

            debug!(behavior = %descriptor.name, methods = descriptor.methods.len(), "Registered behavior");
            if registry
                .descriptors
                .insert(descriptor.name.clone(), descriptor.clone())
                .is_some()
            {
                return Err(KiteError::boot(format!("behavior {} registered twice", descriptor.name)));
            }
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{Behavior, Invocation};
    use crate::descriptor::RouterSpec;
    use async_trait::async_trait;
    use kite_types::Target;
    use serde_json::Value;

    struct Idle;

    #[async_trait(?Send)]
    impl Behavior for Idle {
        async fn invoke(&self, _method: &str, _call: Invocation) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn idle(name: &str) -> Result<Descriptor> {
        Descriptor::builder(name).factory(|_| Ok(Idle)).build()
    }

    #[test]
    fn test_lookup() {
        let registry = Registry::builder()
            .register(idle("zone"))
            .register(idle("npc"))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("npc"));
        assert_eq!(registry.descriptor("zone").unwrap().name, "zone");
        assert!(registry.descriptor("dragon").unwrap_err().is_lookup());
    }

    #[test]
    fn test_duplicate_behavior_rejected() {
        let err = Registry::builder()
            .register(idle("zone"))
            .register(idle("zone"))
            .build()
            .unwrap_err();
        assert_eq!(err.category(), "boot");
    }

    #[test]
    fn test_routers_indexed_by_name() {
        let gate = Descriptor::builder("gate")
            .factory(|_| Ok(Idle))
            .router(RouterSpec::new("client", |_| Ok(Target::global("gate"))))
            .build();
        let registry = Registry::builder().register(gate).build().unwrap();

        assert!(registry.router("client").is_some());
        assert!(registry.router("gate").is_none());
    }

    #[test]
    fn test_failed_descriptor_surfaces() {
        let err = Registry::builder()
            .register(Descriptor::builder("broken").build())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
