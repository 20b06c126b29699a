use std::collections::BTreeSet;

use parking_lot::RwLock;

use crate::error::{KeysetError, KeysetResult};

/// Source of truth for which tenants exist.
pub trait NamespaceDirectory: Send + Sync {
    fn exists(&self, namespace: &str) -> KeysetResult<bool>;
    fn register(&self, namespace: &str) -> KeysetResult<()>;
    fn list(&self) -> KeysetResult<Vec<String>>;
}

pub(crate) fn validate_namespace(namespace: &str) -> KeysetResult<&str> {
    let namespace = namespace.trim();
    if namespace.is_empty() {
        return Err(KeysetError::invalid("namespace must not be blank"));
    }
    if namespace.len() > 128 || namespace.chars().any(char::is_whitespace) {
        return Err(KeysetError::invalid(format!(
            "namespace '{namespace}' is not a valid identifier"
        )));
    }
    Ok(namespace)
}

#[derive(Default)]
pub struct StaticNamespaceDirectory {
    namespaces: RwLock<BTreeSet<String>>,
}

impl StaticNamespaceDirectory {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: RwLock::new(namespaces.into_iter().map(Into::into).collect()),
        }
    }
}

impl NamespaceDirectory for StaticNamespaceDirectory {
    fn exists(&self, namespace: &str) -> KeysetResult<bool> {
        Ok(self.namespaces.read().contains(namespace))
    }

    fn register(&self, namespace: &str) -> KeysetResult<()> {
        let namespace = validate_namespace(namespace)?;
        self.namespaces.write().insert(namespace.to_string());
        Ok(())
    }

    fn list(&self) -> KeysetResult<Vec<String>> {
        Ok(self.namespaces.read().iter().cloned().collect())
    }
}
