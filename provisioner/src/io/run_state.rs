//! Durable run state: step-completion flags and captured secrets.
//!
//! The document is nested JSON (`{"create":{"terraformapplied":{"base":true}}}`)
//! addressed by dotted keys. Every mutation that matters is flushed before the
//! caller moves on, so a crash loses at most the step in flight.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::keys::split_key;
use crate::error::ProvisionError;

/// Persisted key/value state (`.provisioner/state/run_state.json`).
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl RunState {
    /// Empty state bound to `path`; nothing is written until a flush.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: Map::new(),
        }
    }

    /// Load state from disk. A missing file yields an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no run state yet, starting empty");
            return Ok(Self::empty(path));
        }
        debug!(path = %path.display(), "loading run state");
        let contents = fs::read_to_string(path).map_err(|source| ProvisionError::Io {
            op: "read run state",
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse run state {}", path.display()))?;
        let Value::Object(doc) = value else {
            return Err(anyhow!(
                "run state {} must be a JSON object",
                path.display()
            ));
        };
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let segments = split_key(key).ok()?;
        let (last, parents) = segments.split_last()?;
        let mut current = &self.doc;
        for segment in parents {
            current = current.get(*segment)?.as_object()?;
        }
        current.get(*last)
    }

    /// True only if the key holds boolean `true`.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    /// String value for a key, treating empty strings as absent.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Set a dotted key in memory, creating intermediate maps.
    ///
    /// Returns the previous value. Fails if an intermediate segment already
    /// holds a non-map value.
    pub fn set(&mut self, key: &str, value: Value) -> Result<Option<Value>> {
        let segments = split_key(key).map_err(ProvisionError::Prerequisite)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| anyhow!("empty key"))?;
        let mut current = &mut self.doc;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = entry.as_object_mut().ok_or_else(|| {
                ProvisionError::Prerequisite(format!(
                    "cannot set {key}: {segment} already holds a non-map value"
                ))
            })?;
        }
        Ok(current.insert(last.to_string(), value))
    }

    /// Remove a dotted key in memory, pruning maps left empty.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        let segments = split_key(key).map_err(ProvisionError::Prerequisite)?;
        Ok(remove_path(&mut self.doc, &segments))
    }

    /// Set a key and flush immediately.
    ///
    /// If the flush fails the in-memory value is rolled back, so memory never
    /// claims more than the file on disk.
    pub fn commit(&mut self, key: &str, value: Value) -> Result<()> {
        let previous = self.set(key, value)?;
        if let Err(err) = self.flush() {
            warn!(key, "flush failed, rolling back in-memory value");
            match previous {
                Some(prev) => {
                    self.set(key, prev)?;
                }
                None => {
                    self.remove(key)?;
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove a key and flush immediately, restoring it if the flush fails.
    pub fn commit_remove(&mut self, key: &str) -> Result<bool> {
        let Some(previous) = self.remove(key)? else {
            return Ok(false);
        };
        if let Err(err) = self.flush() {
            warn!(key, "flush failed, restoring in-memory value");
            self.set(key, previous)?;
            return Err(err);
        }
        Ok(true)
    }

    /// Atomically write state to disk (temp file + rename).
    pub fn flush(&self) -> Result<()> {
        debug!(path = %self.path.display(), "writing run state");
        let mut buf = serde_json::to_string_pretty(&self.doc)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn remove_path(map: &mut Map<String, Value>, segments: &[&str]) -> Option<Value> {
    let (first, rest) = segments.split_first()?;
    if rest.is_empty() {
        return map.remove(*first);
    }
    let child = map.get_mut(*first)?.as_object_mut()?;
    let removed = remove_path(child, rest);
    if child.is_empty() {
        map.remove(*first);
    }
    removed
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).map_err(|source| ProvisionError::Io {
        op: "create directory",
        path: parent.to_path_buf(),
        source,
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(|source| ProvisionError::Io {
        op: "write temp run state",
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| ProvisionError::Io {
        op: "replace run state",
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
