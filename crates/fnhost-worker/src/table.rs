// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned dispatch table (function name → entry point).
//!
//! A table is immutable once built. A reload builds a complete new table and
//! the runtime swaps the `Arc` in one step, so a call holds whichever table
//! was current when its request was read.

use std::collections::HashMap;
use std::sync::Arc;

use fnhost_protocol::FunctionEntry;

use crate::error::LoadError;
use crate::loader::{FunctionHandler, FunctionLoader};

struct LoadedFunction {
    entry: FunctionEntry,
    handler: Arc<dyn FunctionHandler>,
}

/// Immutable snapshot of a project's callable functions at one version.
pub struct DispatchTable {
    version: u64,
    functions: HashMap<String, LoadedFunction>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("version", &self.version)
            .field("functions", &self.names())
            .finish()
    }
}

impl DispatchTable {
    /// A table with no functions at version 0.
    pub fn empty() -> Self {
        Self {
            version: 0,
            functions: HashMap::new(),
        }
    }

    /// Build the table for `version` from `entries`.
    ///
    /// Entries identical to one in `previous` reuse its handler; everything
    /// else goes through `loader`. Any single failure fails the whole build,
    /// leaving `previous` untouched.
    pub async fn build(
        previous: Option<&DispatchTable>,
        version: u64,
        entries: &[FunctionEntry],
        loader: &dyn FunctionLoader,
    ) -> Result<Self, LoadError> {
        let mut functions = HashMap::with_capacity(entries.len());

        for entry in entries {
            let reused = previous
                .and_then(|t| t.functions.get(&entry.name))
                .filter(|f| f.entry == *entry)
                .map(|f| f.handler.clone());

            let handler = match reused {
                Some(handler) => handler,
                None => loader
                    .load(entry)
                    .await
                    .map_err(|e| LoadError::Function {
                        function: entry.name.clone(),
                        source: Box::new(e),
                    })?,
            };

            functions.insert(
                entry.name.clone(),
                LoadedFunction {
                    entry: entry.clone(),
                    handler,
                },
            );
        }

        Ok(Self { version, functions })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.functions.get(name).map(|f| f.handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo(String);

    #[async_trait]
    impl FunctionHandler for Echo {
        async fn call(&self, _payload: Value) -> Result<Value, String> {
            Ok(json!(self.0))
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl FunctionLoader for CountingLoader {
        async fn load(&self, entry: &FunctionEntry) -> Result<Arc<dyn FunctionHandler>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if entry.name == "broken" {
                return Err(LoadError::MissingEntry(entry.artifact_dir.clone()));
            }
            Ok(Arc::new(Echo(entry.artifact_dir.display().to_string())))
        }
    }

    fn entry(name: &str, dir: &str) -> FunctionEntry {
        FunctionEntry {
            name: name.into(),
            artifact_dir: PathBuf::from(dir),
            env_dir: None,
        }
    }

    #[tokio::test]
    async fn test_build_reuses_unchanged_handlers() {
        let loader = CountingLoader::default();
        let v1 = DispatchTable::build(None, 1, &[entry("a", "a/v1"), entry("b", "b/v1")], &loader)
            .await
            .unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        let v2 = DispatchTable::build(Some(&v1), 2, &[entry("a", "a/v1"), entry("b", "b/v2")], &loader)
            .await
            .unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 3);
        assert_eq!(v2.version(), 2);
        assert_eq!(v2.names(), vec!["a", "b"]);

        let b = v2.get("b").unwrap().call(Value::Null).await.unwrap();
        assert_eq!(b, json!("b/v2"));
    }

    #[tokio::test]
    async fn test_build_omitting_entry_removes_function() {
        let loader = CountingLoader::default();
        let v1 = DispatchTable::build(None, 1, &[entry("a", "a/v1")], &loader)
            .await
            .unwrap();
        let v2 = DispatchTable::build(Some(&v1), 2, &[], &loader).await.unwrap();

        assert!(v1.contains("a"));
        assert!(!v2.contains("a"));
        assert!(v2.is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_names_function() {
        let loader = CountingLoader::default();
        let err = DispatchTable::build(None, 1, &[entry("ok", "ok/v1"), entry("broken", "x")], &loader)
            .await
            .unwrap_err();
        match err {
            LoadError::Function { function, .. } => assert_eq!(function, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
