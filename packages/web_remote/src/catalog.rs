//! Remote Catalog
//!
//! Button layouts are JSON files in the remotes directory. Each layout is
//! served as written; the only requirement is a `buttons` array.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read remotes directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("layout is not a JSON object")]
    NotAnObject,

    #[error("layout has no buttons array")]
    InvalidButtons,
}

/// One remote control layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RemoteLayout {
    body: Map<String, Value>,
}

/// What a single `buttons` entry renders as.
#[derive(Debug, Clone, PartialEq)]
pub enum ButtonKind<'a> {
    /// `{}` or `null`: an empty grid cell.
    Spacer,
    Key { label: &'a str, command: &'a Value },
    Invalid,
}

impl RemoteLayout {
    pub fn name(&self) -> Option<&str> {
        self.body.get("name").and_then(Value::as_str)
    }

    pub fn buttons(&self) -> &[Value] {
        match self.body.get("buttons") {
            Some(Value::Array(buttons)) => buttons,
            _ => &[],
        }
    }

    pub fn button_count(&self) -> usize {
        self.buttons().len()
    }

    pub fn button_kinds(&self) -> impl Iterator<Item = ButtonKind<'_>> {
        self.buttons().iter().map(classify_button)
    }
}

pub fn classify_button(button: &Value) -> ButtonKind<'_> {
    match button {
        Value::Null => ButtonKind::Spacer,
        Value::Object(map) if map.is_empty() => ButtonKind::Spacer,
        Value::Object(map) => {
            let label = map.get("label").and_then(Value::as_str).filter(|l| !l.is_empty());
            let command = map.get("command").filter(|c| !c.is_null());
            match (label, command) {
                (Some(label), Some(command)) => ButtonKind::Key { label, command },
                _ => ButtonKind::Invalid,
            }
        }
        _ => ButtonKind::Invalid,
    }
}

/// Parse one layout file body.
pub fn parse_layout(text: &str) -> Result<RemoteLayout, CatalogError> {
    let Value::Object(body) = serde_json::from_str::<Value>(text)? else {
        return Err(CatalogError::NotAnObject);
    };
    if !matches!(body.get("buttons"), Some(Value::Array(_))) {
        return Err(CatalogError::InvalidButtons);
    }
    Ok(RemoteLayout { body })
}

/// Load every `*.json` layout in `dir`, sorted ascending by button count.
///
/// Files that cannot be read or parsed are logged and skipped; only an
/// unreadable directory is an error.
pub async fn load_catalog(dir: &Path) -> Result<Vec<RemoteLayout>, CatalogError> {
    let read_dir_err = |source| CatalogError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_dir_err)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_dir_err)? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut layouts = Vec::with_capacity(paths.len());
    for path in paths {
        match load_layout(&path).await {
            Ok(layout) => {
                let invalid = layout
                    .button_kinds()
                    .filter(|k| *k == ButtonKind::Invalid)
                    .count();
                if invalid > 0 {
                    warn!(file = %path.display(), invalid, "layout has invalid buttons");
                }
                layouts.push(layout);
            }
            Err(CatalogError::InvalidButtons) => {
                warn!(file = %path.display(), "skipping remote with invalid buttons array");
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "failed to load remote");
            }
        }
    }

    // Stable: equal counts keep file-name order.
    layouts.sort_by_key(RemoteLayout::button_count);
    debug!(count = layouts.len(), dir = %dir.display(), "loaded remote catalog");
    Ok(layouts)
}

async fn load_layout(path: &Path) -> Result<RemoteLayout, CatalogError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CatalogError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    parse_layout(&text)
}
