//! Run-scoped variable store
//!
//! Steps write to the store when their output is `$NAME` and read from it
//! wherever `$NAME` or `${NAME}` appears in inputs, actions and paths.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap_or_else(|e| panic!("invalid variable regex: {e}"))
});

static VAR_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| panic!("invalid name regex: {e}"))
});

/// If `text` is exactly a variable reference (`$NAME` or `${NAME}`), the name
pub fn as_var_ref(text: &str) -> Option<&str> {
    let text = text.trim();
    let name = text.strip_prefix('$')?;
    let name = name
        .strip_prefix('{')
        .and_then(|n| n.strip_suffix('}'))
        .unwrap_or(name);
    VAR_NAME.is_match(name).then_some(name)
}

/// Shared name -> value map; clones share the same storage
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.write().insert(name.into(), value.into());
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.read().clone()
    }

    /// Replace the contents with a snapshot
    pub fn restore(&self, values: HashMap<String, String>) {
        *self.write() = values;
    }

    /// Replace `$NAME` / `${NAME}` with stored values; unknown names are left as written
    pub fn substitute(&self, text: &str) -> String {
        if !text.contains('$') {
            return text.to_string();
        }
        let values = self.read();
        VAR_REF
            .replace_all(text, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match values.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_ref() {
        assert_eq!(as_var_ref("$SUMMARY"), Some("SUMMARY"));
        assert_eq!(as_var_ref("${SUMMARY}"), Some("SUMMARY"));
        assert_eq!(as_var_ref("$1abc"), None);
        assert_eq!(as_var_ref("README.md"), None);
        assert_eq!(as_var_ref("$A b"), None);
    }

    #[test]
    fn test_substitute() {
        let store = VariableStore::new();
        store.set("NAME", "report");
        store.set("DIR", "out");

        assert_eq!(store.substitute("${DIR}/$NAME.md"), "out/report.md");
        assert_eq!(store.substitute("keep $UNKNOWN and $5"), "keep $UNKNOWN and $5");
        assert_eq!(store.substitute("no vars"), "no vars");
    }

    #[test]
    fn test_clones_share_storage() {
        let store = VariableStore::new();
        let worker = store.clone();
        worker.set("X", "from worker");
        assert_eq!(store.get("X").as_deref(), Some("from worker"));
    }

    #[test]
    fn test_snapshot_restore() {
        let store = VariableStore::new();
        store.set("A", "1");
        let snap = store.snapshot();
        store.set("B", "2");
        store.restore(snap);
        assert_eq!(store.get("A").as_deref(), Some("1"));
        assert!(store.get("B").is_none());
    }
}
