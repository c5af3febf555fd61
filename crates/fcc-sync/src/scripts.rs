//! Server-provided scripts, kept behind a sandbox boundary.
//!
//! The session only tracks which scripts are loaded; evaluating them is the
//! sandbox's business. Any sandbox failure drops the script.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("script {name}: empty code")]
    EmptyCode { name: String },
    #[error("script {name}: invalid data: {reason}")]
    InvalidData { name: String, reason: String },
    #[error("script {name}: {reason}")]
    Rejected { name: String, reason: String },
}

pub trait ScriptSandbox: Send {
    fn load(&mut self, name: &str, code: &str, data: &str) -> Result<(), ScriptError>;
    fn update_data(&mut self, name: &str, data: &str) -> Result<(), ScriptError>;
    fn unload(&mut self, name: &str);
}

/// Keeps each script's code as an opaque blob and its data as parsed JSON.
/// Nothing is executed.
#[derive(Debug, Default)]
pub struct PayloadSandbox {
    scripts: BTreeMap<String, (String, Value)>,
}

impl PayloadSandbox {
    pub fn data(&self, name: &str) -> Option<&Value> {
        self.scripts.get(name).map(|(_, data)| data)
    }

    pub fn code(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(|(code, _)| code.as_str())
    }

    fn parse_data(name: &str, data: &str) -> Result<Value, ScriptError> {
        serde_json::from_str(data).map_err(|err| ScriptError::InvalidData {
            name: name.to_string(),
            reason: err.to_string(),
        })
    }
}

impl ScriptSandbox for PayloadSandbox {
    fn load(&mut self, name: &str, code: &str, data: &str) -> Result<(), ScriptError> {
        if code.trim().is_empty() {
            return Err(ScriptError::EmptyCode {
                name: name.to_string(),
            });
        }
        let data = Self::parse_data(name, data)?;
        self.scripts.insert(name.to_string(), (code.to_string(), data));
        Ok(())
    }

    fn update_data(&mut self, name: &str, data: &str) -> Result<(), ScriptError> {
        let parsed = Self::parse_data(name, data)?;
        match self.scripts.get_mut(name) {
            Some(entry) => {
                entry.1 = parsed;
                Ok(())
            }
            None => Err(ScriptError::Rejected {
                name: name.to_string(),
                reason: "not loaded".to_string(),
            }),
        }
    }

    fn unload(&mut self, name: &str) {
        self.scripts.remove(name);
    }
}

pub(crate) struct ScriptHost {
    sandbox: Box<dyn ScriptSandbox>,
    loaded: BTreeSet<String>,
}

impl ScriptHost {
    pub(crate) fn new(sandbox: Box<dyn ScriptSandbox>) -> Self {
        Self {
            sandbox,
            loaded: BTreeSet::new(),
        }
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.loaded.contains(name)
    }

    /// Loads a script, replacing any script of the same name.
    pub(crate) fn add(&mut self, name: &str, code: &str, data: &str) {
        if self.loaded.contains(name) {
            self.remove(name);
        }
        match self.sandbox.load(name, code, data) {
            Ok(()) => {
                self.loaded.insert(name.to_string());
                debug!(event = "script_loaded", script = name);
            }
            Err(err) => {
                self.sandbox.unload(name);
                warn!(event = "script_load_failed", script = name, error = %err);
            }
        }
    }

    /// Returns false when no script of that name is loaded.
    pub(crate) fn update(&mut self, name: &str, data: &str) -> bool {
        if !self.loaded.contains(name) {
            return false;
        }
        if let Err(err) = self.sandbox.update_data(name, data) {
            warn!(event = "script_data_failed", script = name, error = %err);
            self.remove(name);
        }
        true
    }

    pub(crate) fn remove(&mut self, name: &str) -> bool {
        if !self.loaded.remove(name) {
            return false;
        }
        self.sandbox.unload(name);
        debug!(event = "script_unloaded", script = name);
        true
    }

    pub(crate) fn clear(&mut self) {
        let names: Vec<String> = self.loaded.iter().cloned().collect();
        for name in names {
            self.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LoggingSandbox {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LoggingSandbox {
        fn entries(&self) -> Vec<String> {
            self.log.lock().expect("log").clone()
        }
    }

    impl ScriptSandbox for LoggingSandbox {
        fn load(&mut self, name: &str, code: &str, _data: &str) -> Result<(), ScriptError> {
            self.log.lock().expect("log").push(format!("load {name}"));
            if code == "throw" {
                return Err(ScriptError::Rejected {
                    name: name.to_string(),
                    reason: "threw".to_string(),
                });
            }
            Ok(())
        }

        fn update_data(&mut self, name: &str, data: &str) -> Result<(), ScriptError> {
            self.log.lock().expect("log").push(format!("data {name}"));
            if data == "bad" {
                return Err(ScriptError::Rejected {
                    name: name.to_string(),
                    reason: "bad data".to_string(),
                });
            }
            Ok(())
        }

        fn unload(&mut self, name: &str) {
            self.log.lock().expect("log").push(format!("unload {name}"));
        }
    }

    #[test]
    fn duplicate_name_unloads_the_old_script_first() {
        let sandbox = LoggingSandbox::default();
        let mut host = ScriptHost::new(Box::new(sandbox.clone()));
        host.add("leveling", "fn", "{}");
        host.add("leveling", "fn2", "{}");
        assert_eq!(
            sandbox.entries(),
            vec!["load leveling", "unload leveling", "load leveling"]
        );
        assert_eq!(host.names().collect::<Vec<_>>(), vec!["leveling"]);
    }

    #[test]
    fn sandbox_failures_remove_the_script() {
        let sandbox = LoggingSandbox::default();
        let mut host = ScriptHost::new(Box::new(sandbox.clone()));
        host.add("broken", "throw", "{}");
        assert!(!host.contains("broken"));

        host.add("ok", "fn", "{}");
        assert!(host.update("ok", "bad"));
        assert!(!host.contains("ok"));
        assert!(!host.update("ok", "{}"));
        assert!(!host.remove("ok"));
    }

    #[test]
    fn payload_sandbox_requires_json_data() {
        let mut sandbox = PayloadSandbox::default();
        assert!(matches!(
            sandbox.load("s", "  ", "{}"),
            Err(ScriptError::EmptyCode { .. })
        ));
        assert!(matches!(
            sandbox.load("s", "code", "{oops"),
            Err(ScriptError::InvalidData { .. })
        ));
        sandbox.load("s", "code", r#"{"z": 0.2}"#).expect("load");
        sandbox.update_data("s", r#"{"z": 0.3}"#).expect("update");
        assert_eq!(sandbox.data("s"), Some(&serde_json::json!({"z": 0.3})));
        assert_eq!(sandbox.code("s"), Some("code"));
        assert!(sandbox.update_data("t", "{}").is_err());
    }

    #[test]
    fn clear_unloads_everything() {
        let sandbox = LoggingSandbox::default();
        let mut host = ScriptHost::new(Box::new(sandbox.clone()));
        host.add("a", "fn", "{}");
        host.add("b", "fn", "{}");
        host.clear();
        assert_eq!(host.names().count(), 0);
        assert!(sandbox.entries().ends_with(&["unload a".to_string(), "unload b".to_string()]));
    }
}
