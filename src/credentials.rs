//! Resolution of the Vertex AI credentials configured for a request.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::{DittoError, Result};

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read Vertex AI credentials file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Returns the raw credentials content: inline credentials when set,
/// otherwise the contents of the configured file. The file is not touched
/// when inline credentials are present.
///
/// Relative paths resolve against `cwd`.
pub async fn resolve_credentials_content(
    config: &LlmConfig,
    cwd: &Path,
) -> std::result::Result<Option<String>, CredentialsError> {
    if let Some(inline) = config
        .vertexai_credentials
        .as_ref()
        .filter(|raw| !raw.trim().is_empty())
    {
        return Ok(Some(inline.clone()));
    }

    let Some(path) = config
        .vertexai_credentials_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    else {
        return Ok(None);
    };

    let path = Path::new(path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    tracing::debug!(path = %path.display(), "reading Vertex AI credentials file");
    tokio::fs::read_to_string(&path)
        .await
        .map(Some)
        .map_err(|source| CredentialsError::Read { path, source })
}

pub fn parse_credentials(content: &str) -> Result<Value> {
    serde_json::from_str(content).map_err(|err| {
        DittoError::invalid_vertex_credentials(format!(
            "Vertex AI credentials are not valid JSON: {err}"
        ))
    })
}
