//! Flow definition files on disk.
//!
//! Flow files are `.yaml`, `.yml` or `.json` documents holding a single
//! flow definition. The format is picked from the extension.

use std::path::{Path, PathBuf};

use flowrun_core::workflow::{ParseError, parse_flow_json, parse_flow_yaml};
use flowrun_types::flow::FlowDefinition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("unsupported flow file extension: {0}")]
    UnsupportedExtension(PathBuf),
}

fn is_flow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Parse flow definition text, choosing the format from `path`'s extension.
pub fn parse_flow_file(path: &Path, content: &str) -> Result<FlowDefinition, FlowFileError> {
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => parse_flow_yaml(content),
        Some("json") => parse_flow_json(content),
        _ => return Err(FlowFileError::UnsupportedExtension(path.to_path_buf())),
    };
    parsed.map_err(|source| FlowFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and parse a single flow file. Does not validate.
pub async fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowFileError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| FlowFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_flow_file(path, &content)
}

/// Load every flow file directly inside `dir`, sorted by file name.
///
/// Files that fail to parse are logged and skipped. A missing directory
/// yields an empty list.
pub async fn load_flow_dir(dir: &Path) -> Result<Vec<(PathBuf, FlowDefinition)>, FlowFileError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %dir.display(), "flow directory not found");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(FlowFileError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut paths = Vec::new();
    loop {
        let entry = entries.next_entry().await.map_err(|source| FlowFileError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let Some(entry) = entry else { break };
        let path = entry.path();
        if path.is_file() && is_flow_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut flows = Vec::with_capacity(paths.len());
    for path in paths {
        match load_flow_file(&path).await {
            Ok(flow) => flows.push((path, flow)),
            Err(e) => tracing::warn!(error = %e, "skipping flow file"),
        }
    }
    Ok(flows)
}
