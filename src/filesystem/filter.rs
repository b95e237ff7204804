//! Hidden and junk filename classification
//!
//! Hidden entries are dropped from listings (unless asked for) and pruned
//! from the index walk. Junk only keeps files out of the search index;
//! they stay browsable.

use std::collections::HashSet;
use std::path::Path;

use glob_match::glob_match;
use serde::Deserialize;

use super::config::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    /// A name starting with any of these is hidden
    pub hidden_prefixes: Vec<char>,

    /// Lowercase globs matched against the whole lowercased name
    pub hidden_names: Vec<String>,

    /// Exact, case-sensitive names kept out of the index
    pub junk_names: Vec<String>,

    /// Lowercase extensions (no dot) kept out of the index
    pub junk_extensions: HashSet<String>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            hidden_prefixes: vec!['.', '$', '~'],
            hidden_names: [
                "system volume information",
                "*recycle",
                "*recycler",
                "desktop.ini",
                "thumbs.db",
                "node_modules",
                "vendor",
                "__pycache__",
                "dist",
                "build",
                "target",
                "obj",
                "bin",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            junk_names: ["LICENSE", "README", "Makefile"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            junk_extensions: [
                // code
                "c", "cpp", "h", "hpp", "cs", "go", "java", "js", "jsx", "ts", "tsx", "php", "py",
                "rb", "pl", "swift", "kt", "kts", "rs", "dart", "lua", "sh", "bat", "ps1", "cmd",
                "vb", "vbs", "sql", "r", "m",
                // web and config
                "html", "css", "scss", "less", "sass", "json", "xml", "yaml", "yml", "toml",
                "ini", "env", "lock", "mod", "sum", "map", "gitignore", "dockerignore",
                // build output
                "class", "jar", "war", "ear", "o", "obj", "dll", "so", "dylib", "exe", "bin",
                "dat", "log", "tmp", "bak", "swp",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl FilterPolicy {
    /// Load a policy from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadPolicy {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut policy: FilterPolicy = serde_json::from_str(raw)?;
        policy.hidden_names = policy.hidden_names.iter().map(|p| p.to_lowercase()).collect();
        policy.junk_extensions = policy
            .junk_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        Ok(policy)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        if name
            .chars()
            .next()
            .is_some_and(|c| self.hidden_prefixes.contains(&c))
        {
            return true;
        }
        let lowered = name.to_lowercase();
        self.hidden_names
            .iter()
            .any(|pattern| glob_match(pattern, &lowered))
    }

    pub fn is_project_junk(&self, name: &str) -> bool {
        if self.junk_names.iter().any(|junk| junk == name) {
            return true;
        }
        let ext = super::path_utils::extension_of(name);
        !ext.is_empty() && self.junk_extensions.contains(&ext)
    }
}
