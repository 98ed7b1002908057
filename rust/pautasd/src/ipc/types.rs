use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Deserialize;

/// One line of input: `{"id", "method", "params"}`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// An opened workspace directory and its database.
pub struct Workspace {
    pub path: PathBuf,
    pub conn: Connection,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<Workspace>,
}

impl AppState {
    pub fn conn(&self) -> Option<&Connection> {
        self.workspace.as_ref().map(|w| &w.conn)
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(|w| w.path.as_path())
    }
}
