use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::completion::ROOT_CHANNEL;
use crate::error::Error;

/// Prefix reserved for automatically named callbacks.
pub const CALLBACK_PREFIX: &str = "_callback";

/// User handler invoked for deliveries on `POST /<name>/<job_id>`.
#[async_trait]
pub trait WebhookCallback: Send + Sync {
    async fn on_notification(&self, job_id: &str, payload: &Value) -> Result<()>;
}

/// Adapts a synchronous closure. It runs on the blocking pool so a slow
/// closure cannot stall other deliveries.
pub struct FunctionCallback<F> {
    callback: Arc<F>,
}

impl<F> FunctionCallback<F>
where
    F: Fn(&str, &Value) -> Result<()> + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl<F> WebhookCallback for FunctionCallback<F>
where
    F: Fn(&str, &Value) -> Result<()> + Send + Sync + 'static,
{
    async fn on_notification(&self, job_id: &str, payload: &Value) -> Result<()> {
        let callback = self.callback.clone();
        let job_id = job_id.to_string();
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || callback(&job_id, &payload))
            .await
            .map_err(|e| anyhow::anyhow!("callback panicked: {}", e))?
    }
}

/// Identifies a registered callback by name, or by the index of an automatic
/// `_callback_<n>` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackId {
    Name(String),
    Index(usize),
}

impl CallbackId {
    pub fn to_name(&self) -> String {
        match self {
            CallbackId::Name(name) => name.clone(),
            CallbackId::Index(index) => auto_name(*index),
        }
    }
}

impl From<&str> for CallbackId {
    fn from(name: &str) -> Self {
        CallbackId::Name(name.to_string())
    }
}

impl From<String> for CallbackId {
    fn from(name: String) -> Self {
        CallbackId::Name(name)
    }
}

impl From<usize> for CallbackId {
    fn from(index: usize) -> Self {
        CallbackId::Index(index)
    }
}

impl Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_name())
    }
}

fn auto_name(index: usize) -> String {
    format!("{}_{}", CALLBACK_PREFIX, index)
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Validation("callback name must not be empty".into()));
    }
    if name.starts_with(CALLBACK_PREFIX) {
        return Err(Error::Validation(format!(
            "prefix {} is reserved for callback names",
            CALLBACK_PREFIX
        )));
    }
    if name == ROOT_CHANNEL {
        return Err(Error::Validation(format!("{} is reserved", ROOT_CHANNEL)));
    }
    if name.contains('/') {
        return Err(Error::Validation(format!(
            "callback name {} must be a single path segment",
            name
        )));
    }
    Ok(())
}

/// Immutable snapshot of the named routes served by one listener generation.
#[derive(Clone, Default)]
pub struct RouteTable {
    callbacks: HashMap<String, Arc<dyn WebhookCallback>>,
}

impl RouteTable {
    pub fn get(&self, name: &str) -> Option<Arc<dyn WebhookCallback>> {
        self.callbacks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl FromIterator<(String, Arc<dyn WebhookCallback>)> for RouteTable {
    fn from_iter<I: IntoIterator<Item = (String, Arc<dyn WebhookCallback>)>>(iter: I) -> Self {
        Self {
            callbacks: iter.into_iter().collect(),
        }
    }
}

pub struct CallbackRegistry {
    callbacks: RwLock<BTreeMap<String, Arc<dyn WebhookCallback>>>,
    next_index: AtomicUsize,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(BTreeMap::new()),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Registers a handler and returns its name. Without a name the next free
    /// `_callback_<n>` is assigned; explicit names are validated and must be unused.
    pub fn register(
        &self,
        callback: Arc<dyn WebhookCallback>,
        name: Option<&str>,
    ) -> Result<String, Error> {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());

        let name = match name {
            Some(name) => {
                validate_name(name)?;
                if callbacks.contains_key(name) {
                    return Err(Error::Validation(format!(
                        "callback {} is already registered",
                        name
                    )));
                }
                name.to_string()
            }
            None => loop {
                let candidate = auto_name(self.next_index.fetch_add(1, Ordering::SeqCst));
                if !callbacks.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        callbacks.insert(name.clone(), callback);
        info!("Registered callback {}", name);
        Ok(name)
    }

    /// Removes the given callbacks and returns the names actually removed.
    pub fn unregister(&self, ids: &[CallbackId]) -> Vec<String> {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();

        for id in ids {
            let name = id.to_name();
            if callbacks.remove(&name).is_some() {
                info!("Unregistered callback {}", name);
                removed.push(name);
            } else {
                warn!("Callback {} not registered", name);
            }
        }

        removed
    }

    pub fn unregister_all(&self) -> Vec<String> {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        let removed: Vec<String> = std::mem::take(&mut *callbacks).into_keys().collect();
        info!("Unregistered all callbacks: {:?}", removed);
        removed
    }

    pub fn names(&self) -> Vec<String> {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        callbacks.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        callbacks.contains_key(name)
    }

    pub fn route_table(&self) -> RouteTable {
        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        callbacks
            .iter()
            .map(|(name, callback)| (name.clone(), callback.clone()))
            .collect()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn WebhookCallback> {
        Arc::new(FunctionCallback::new(|_job_id: &str, _payload: &Value| Ok(())))
    }

    #[test]
    fn test_automatic_names() {
        let registry = CallbackRegistry::new();
        assert_eq!(registry.register(noop(), None).unwrap(), "_callback_0");
        assert_eq!(registry.register(noop(), None).unwrap(), "_callback_1");
        assert_eq!(registry.register(noop(), Some("progress")).unwrap(), "progress");
        assert_eq!(
            registry.names(),
            vec!["_callback_0", "_callback_1", "progress"]
        );
    }

    #[test]
    fn test_automatic_names_are_not_reused() {
        let registry = CallbackRegistry::new();
        registry.register(noop(), None).unwrap();
        registry.register(noop(), None).unwrap();
        registry.unregister(&[CallbackId::Index(0)]);

        assert_eq!(registry.register(noop(), None).unwrap(), "_callback_2");
        assert_eq!(registry.names(), vec!["_callback_1", "_callback_2"]);
    }

    #[test]
    fn test_reserved_names_rejected() {
        let registry = CallbackRegistry::new();
        for name in ["_callback", "_callback_7", ROOT_CHANNEL, "", "a/b"] {
            assert!(
                matches!(registry.register(noop(), Some(name)), Err(Error::Validation(_))),
                "{} should be rejected",
                name
            );
        }
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = CallbackRegistry::new();
        registry.register(noop(), Some("c1")).unwrap();
        assert!(matches!(
            registry.register(noop(), Some("c1")),
            Err(Error::Validation(_))
        ));
        assert_eq!(registry.names(), vec!["c1"]);
    }

    #[test]
    fn test_unregister_by_name_and_index() {
        let registry = CallbackRegistry::new();
        registry.register(noop(), None).unwrap();
        registry.register(noop(), Some("c1")).unwrap();
        registry.register(noop(), Some("c2")).unwrap();

        let removed = registry.unregister(&[0usize.into(), "c2".into(), "missing".into()]);
        assert_eq!(removed, vec!["_callback_0", "c2"]);
        assert_eq!(registry.names(), vec!["c1"]);
    }

    #[test]
    fn test_unregister_all() {
        let registry = CallbackRegistry::new();
        registry.register(noop(), Some("c1")).unwrap();
        registry.register(noop(), None).unwrap();

        let mut removed = registry.unregister_all();
        removed.sort();
        assert_eq!(removed, vec!["_callback_0", "c1"]);
        assert!(registry.route_table().is_empty());
    }

    #[test]
    fn test_route_table_is_a_snapshot() {
        let registry = CallbackRegistry::new();
        registry.register(noop(), Some("c1")).unwrap();
        let table = registry.route_table();

        registry.register(noop(), Some("c2")).unwrap();
        assert_eq!(table.names(), vec!["c1"]);
        assert!(registry.route_table().contains("c2"));
    }

    #[tokio::test]
    async fn test_function_callback_error_propagates() {
        let callback = FunctionCallback::new(|job_id: &str, _payload: &Value| {
            Err(anyhow::anyhow!("cannot handle {}", job_id))
        });
        let err = callback
            .on_notification("job-1", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot handle job-1");
    }

    #[tokio::test]
    async fn test_function_callback_panic_is_an_error() {
        let callback = FunctionCallback::new(|_job_id: &str, _payload: &Value| -> Result<()> {
            panic!("boom")
        });
        let result = callback.on_notification("job-1", &serde_json::json!({})).await;
        assert!(result.is_err());
    }
}
