//! Publish runner debug ports as VS Code attach configurations.
//!
//! Entries we own are named `FTL JVM - <module>` or `FTL GO - <module>`.
//! Their ports are rewritten in place on every sync; everything else in
//! `launch.json` is left alone.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

const PROJECT_FILE: &str = "project.toml";
const VSCODE_DIR: &str = ".vscode";
const LAUNCH_FILE: &str = "launch.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub port: u16,
    pub language: String,
}

#[derive(Debug, Error)]
pub enum IdeError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} does not hold a JSON object")]
    Malformed(PathBuf),

    #[error("no .vscode directory or {PROJECT_FILE} above {0}")]
    NoProject(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> IdeError + '_ {
    move |source| IdeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The launch entry for a module, or `None` for languages we cannot attach to.
fn launch_entry(module: &str, info: &DebugInfo) -> Option<(String, Value)> {
    match info.language.as_str() {
        "java" | "kotlin" => {
            let name = format!("FTL JVM - {module}");
            let entry = json!({
                "name": name,
                "type": "java",
                "request": "attach",
                "hostName": "127.0.0.1",
                "port": info.port,
            });
            Some((name, entry))
        }
        "go" => {
            let name = format!("FTL GO - {module}");
            let entry = json!({
                "name": name,
                "type": "go",
                "request": "attach",
                "mode": "remote",
                "apiVersion": 2,
                "host": "127.0.0.1",
                "port": info.port,
            });
            Some((name, entry))
        }
        _ => None,
    }
}

#[derive(Debug)]
pub struct IdeIntegration {
    project_path: PathBuf,
    lock: Mutex<()>,
}

impl IdeIntegration {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Nearest existing `folder` from the project path upward, stopping at
    /// the directory holding `project.toml`. When none exists, the path it
    /// would have next to `project.toml` if `create` is set.
    fn find_folder(&self, folder: &str, create: bool) -> Option<PathBuf> {
        let mut current = Some(self.project_path.as_path());
        while let Some(dir) = current {
            let candidate = dir.join(folder);
            if candidate.is_dir() {
                return Some(candidate);
            }
            if dir.join(PROJECT_FILE).is_file() {
                return create.then_some(candidate);
            }
            current = dir.parent();
        }
        None
    }

    /// Write `ports` into `launch.json`, returning the file written.
    pub fn sync(&self, ports: &BTreeMap<String, DebugInfo>) -> Result<PathBuf, IdeError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = self
            .find_folder(VSCODE_DIR, true)
            .ok_or_else(|| IdeError::NoProject(self.project_path.clone()))?;
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        let path = dir.join(LAUNCH_FILE);

        let mut contents = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(IdeError::Malformed(path)),
                Err(source) => return Err(IdeError::Json { path, source }),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let mut map = Map::new();
                map.insert("version".into(), Value::from("0.2.0"));
                map
            }
            Err(err) => return Err(io_error(&path)(err)),
        };

        let mut configurations = match contents.remove("configurations") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        for (module, info) in ports {
            let Some((name, entry)) = launch_entry(module, info) else {
                continue;
            };
            let existing = configurations
                .iter_mut()
                .find(|c| c.get("name").and_then(Value::as_str) == Some(name.as_str()));
            match existing {
                Some(Value::Object(config)) => {
                    config.insert("port".into(), Value::from(info.port));
                }
                _ => configurations.push(entry),
            }
        }
        contents.insert("configurations".into(), Value::Array(configurations));

        let text = serde_json::to_string_pretty(&Value::Object(contents)).map_err(|source| IdeError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(io_error(&path))?;
        debug!(path = %path.display(), modules = ports.len(), "synced ide debug configurations");
        Ok(path)
    }
}
