//! Optional capabilities a connection may expose.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::Connection;
use crate::error::Result;

/// A process running on the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Process selection for backends that attach to a single console process
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Attach to `pid`, returning the previously attached pid
    async fn attach_to_process(&self, pid: u32) -> Result<u32>;

    async fn find_game_process(&self) -> Result<Option<ProcessInfo>>;

    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>>;
}

/// Capability handles keyed by their type, filled once when a connection is built.
#[derive(Default)]
pub struct FeatureSet {
    features: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the implementation of `T`, replacing any earlier one
    pub fn insert<T: ?Sized + Send + Sync + 'static>(&mut self, handle: Arc<T>) {
        self.features.insert(TypeId::of::<T>(), Box::new(handle));
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.features
            .get(&TypeId::of::<T>())
            .and_then(|handle| handle.downcast_ref::<Arc<T>>())
            .cloned()
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.features.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSet")
            .field("count", &self.features.len())
            .finish()
    }
}

/// Look up capability `T` on a connection.
///
/// ```ignore
/// if let Some(control) = try_get_feature::<dyn ProcessControl, _>(&*connection) {
///     let processes = control.enumerate_processes().await?;
/// }
/// ```
pub fn try_get_feature<T, C>(connection: &C) -> Option<Arc<T>>
where
    T: ?Sized + Send + Sync + 'static,
    C: Connection + ?Sized,
{
    connection.features().get::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u32);

    #[async_trait]
    impl ProcessControl for Fixed {
        async fn attach_to_process(&self, _pid: u32) -> Result<u32> {
            Ok(self.0)
        }

        async fn find_game_process(&self) -> Result<Option<ProcessInfo>> {
            Ok(None)
        }

        async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_feature_lookup_by_trait_object() {
        let mut features = FeatureSet::new();
        assert!(features.get::<dyn ProcessControl>().is_none());

        features.insert::<dyn ProcessControl>(Arc::new(Fixed(77)));
        assert!(features.contains::<dyn ProcessControl>());
        assert_eq!(features.len(), 1);

        let control = features.get::<dyn ProcessControl>().unwrap();
        assert_eq!(control.attach_to_process(1).await.unwrap(), 77);
    }

    #[test]
    fn test_feature_lookup_by_concrete_type() {
        let mut features = FeatureSet::new();
        features.insert(Arc::new(String::from("hello")));
        assert_eq!(features.get::<String>().as_deref().map(String::as_str), Some("hello"));
        assert!(features.get::<u32>().is_none());
    }
}
