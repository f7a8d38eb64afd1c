//! Case-insensitive environment maps used to configure tool calls

use std::collections::{BTreeMap, HashMap};

/// String map whose keys compare case-insensitively.
///
/// The most recently set spelling of a key is kept for iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseInsensitiveEnv {
    entries: BTreeMap<String, (String, String)>,
}

impl CaseInsensitiveEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, or an empty string when unset
    pub fn get(&self, key: &str) -> &str {
        self.entries
            .get(&key.to_lowercase())
            .map(|(_, value)| value.as_str())
            .unwrap_or("")
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        self.entries.insert(key.to_lowercase(), (key, value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_lowercase()).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries using each key's last-set spelling
    pub fn all(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Copy every entry of `other` into this map, overriding matching keys
    pub fn merge(&mut self, other: &CaseInsensitiveEnv) {
        for (key, value) in other.all() {
            self.set(key, value);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CaseInsensitiveEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = CaseInsensitiveEnv::new();
        for (key, value) in iter {
            env.set(key, value);
        }
        env
    }
}

impl From<HashMap<String, String>> for CaseInsensitiveEnv {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

/// The two environment layers a tool call sees
#[derive(Debug, Clone, Default)]
pub struct ToolCallEnv {
    /// Gateway-owned values, e.g. toolset or source environments
    pub system_env: CaseInsensitiveEnv,
    /// Per-call values supplied by the caller
    pub user_config: CaseInsensitiveEnv,
}

impl ToolCallEnv {
    pub fn new(system_env: CaseInsensitiveEnv, user_config: CaseInsensitiveEnv) -> Self {
        Self {
            system_env,
            user_config,
        }
    }

    /// System values as the base, user values layered on top
    pub fn merged(&self) -> CaseInsensitiveEnv {
        let mut merged = self.system_env.clone();
        merged.merge(&self.user_config);
        merged
    }
}

/// Canonical HTTP header spelling: first letter and letters after `-` upper-cased
pub fn canonical_header_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for c in key.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Header name an environment variable is projected to (`FOO_BAR` becomes `Foo-Bar`)
pub fn to_http_header(env_key: &str) -> String {
    canonical_header_key(&env_key.replace('_', "-"))
}
