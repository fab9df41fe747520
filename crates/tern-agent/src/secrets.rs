//! Secret values exposed to tool executors
//!
//! Executors ask the registry which secrets a command mentions, export the
//! resolved values into the command's environment, and mask those values in
//! any output before it reaches the model.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;

/// Placeholder written over secret values in tool output
pub const SECRET_MASK: &str = "<secret-hidden>";

/// Callback producing a secret value on demand
pub type SecretProvider = Arc<dyn Fn() -> anyhow::Result<String> + Send + Sync>;

/// A secret known up front or fetched when needed
#[derive(Clone)]
pub enum SecretValue {
    Static(String),
    Provider(SecretProvider),
}

impl SecretValue {
    pub fn provider<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<String> + Send + Sync + 'static,
    {
        SecretValue::Provider(Arc::new(f))
    }

    fn resolve(&self) -> anyhow::Result<String> {
        match self {
            SecretValue::Static(value) => Ok(value.clone()),
            SecretValue::Provider(provider) => provider(),
        }
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        SecretValue::Static(value)
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        SecretValue::Static(value.to_string())
    }
}

/// Secrets available to one conversation
#[derive(Default)]
pub struct SecretRegistry {
    secrets: RwLock<HashMap<String, SecretValue>>,
    /// Last value handed out per key, used for masking even if a provider later fails
    exported: RwLock<HashMap<String, String>>,
}

impl fmt::Debug for SecretRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.secrets.read().keys().cloned().collect();
        keys.sort_unstable();
        f.debug_struct("SecretRegistry").field("keys", &keys).finish()
    }
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace secrets
    pub fn update<I, K, V>(&self, secrets: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<SecretValue>,
    {
        let mut map = self.secrets.write();
        for (key, value) in secrets {
            map.insert(key.into(), value.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    /// Keys mentioned in `text`, compared case-insensitively
    pub fn find_secrets_in_text(&self, text: &str) -> BTreeSet<String> {
        let lowered = text.to_lowercase();
        self.secrets
            .read()
            .keys()
            .filter(|key| lowered.contains(&key.to_lowercase()))
            .cloned()
            .collect()
    }

    /// Resolve the secrets a command refers to, as environment variables.
    ///
    /// Providers that fail are logged and skipped.
    pub fn resolve_for_command(&self, command: &str) -> HashMap<String, String> {
        let found = self.find_secrets_in_text(command);
        if found.is_empty() {
            return HashMap::new();
        }
        tracing::debug!(keys = ?found, "Found secrets in command");

        let secrets = self.secrets.read().clone();
        let mut env = HashMap::new();
        for key in found {
            let Some(value) = secrets.get(&key) else {
                continue;
            };
            match value.resolve() {
                Ok(value) => {
                    self.exported.write().insert(key.clone(), value.clone());
                    env.insert(key, value);
                }
                Err(e) => {
                    tracing::error!("Failed to retrieve secret for key '{}': {}", key, e);
                }
            }
        }
        env
    }

    /// Replace every exported secret value in `text` with [`SECRET_MASK`]
    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for value in self.exported.read().values() {
            if !value.is_empty() {
                masked = masked.replace(value.as_str(), SECRET_MASK);
            }
        }
        masked
    }
}
