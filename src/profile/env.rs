use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;

/// Configuration lookup layered over the process environment.
///
/// Values from a dotenv file shadow process variables; blank process values
/// are treated as unset.
#[derive(Clone, Default)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values routinely hold credentials; only the keys are printed.
        f.debug_struct("Env")
            .field("dotenv_keys", &self.dotenv.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
        }
    }

    pub async fn load_dotenv(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(Self::parse_dotenv(&contents))
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dotenv.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.dotenv.get(key) {
            Some(value) => Some(value.clone()),
            None => std::env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

/// Parses `KEY=value` lines, accepting an `export ` prefix, `#` comments and
/// single or double quoted values. Keys with blank values are skipped.
pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").map_or(line, str::trim_start);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            let value = unquote(value.trim());
            (!key.is_empty() && !value.trim().is_empty())
                .then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
