// Copyright 2025-2026 CEMAXECUTER LLC

//! Persisted JSON configuration shared between a module and its instances.
//!
//! Every read-modify-write goes through [`ConfigManager::acquire`], which hands
//! out a scoped guard. The guard releases the document when dropped, so early
//! returns cannot leave the store locked. Modified releases wake the auto-save
//! worker when it is enabled.

use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config serialization: {0}")]
    Json(#[from] serde_json::Error),
}

struct AutoSave {
    notify: Sender<()>,
    worker: JoinHandle<()>,
}

pub struct ConfigManager {
    path: PathBuf,
    conf: Arc<Mutex<Value>>,
    auto_save: Mutex<Option<AutoSave>>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conf: Arc::new(Mutex::new(Value::Object(Default::default()))),
            auto_save: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document from disk.
    ///
    /// A missing or unreadable file is replaced by `default` and written back.
    /// Top-level keys of `default` missing from the file are filled in.
    pub fn load(&self, default: Value) -> Result<(), ConfigError> {
        let loaded = match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(v) if v.is_object() => Some(v),
                Ok(_) => {
                    log::warn!("config {} is not a JSON object, resetting", self.path.display());
                    None
                }
                Err(e) => {
                    log::warn!("config {} is corrupted ({}), resetting", self.path.display(), e);
                    None
                }
            },
            Err(_) => {
                log::info!("config {} does not exist, creating it", self.path.display());
                None
            }
        };

        let mut dirty = loaded.is_none();
        let mut conf = loaded.unwrap_or_else(|| default.clone());
        if let (Some(obj), Some(def)) = (conf.as_object_mut(), default.as_object()) {
            for (key, value) in def {
                if !obj.contains_key(key) {
                    log::debug!("config {}: adding missing key '{}'", self.path.display(), key);
                    obj.insert(key.clone(), value.clone());
                    dirty = true;
                }
            }
        }

        *self.conf.lock().unwrap() = conf;
        if dirty {
            self.save()?;
        }
        Ok(())
    }

    /// Write the document to disk as pretty-printed JSON.
    pub fn save(&self) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(&*self.conf.lock().unwrap())?;
        write_file(&self.path, &text)
    }

    /// Exclusive, scoped access to the document.
    pub fn acquire(&self) -> ConfigGuard<'_> {
        let notify = self
            .auto_save
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.notify.clone());
        ConfigGuard {
            conf: self.conf.lock().unwrap(),
            modified: false,
            notify,
        }
    }

    /// Save in the background after every modified release.
    pub fn enable_auto_save(&self) {
        let mut slot = self.auto_save.lock().unwrap();
        if slot.is_some() {
            return;
        }

        let (notify, rx) = channel::unbounded::<()>();
        let conf = Arc::clone(&self.conf);
        let path = self.path.clone();
        let spawned = thread::Builder::new()
            .name("config-autosave".to_string())
            .spawn(move || {
                while rx.recv().is_ok() {
                    // Coalesce bursts of releases into one write
                    while rx.try_recv().is_ok() {}
                    let text = match serde_json::to_string_pretty(&*conf.lock().unwrap()) {
                        Ok(t) => t,
                        Err(e) => {
                            log::error!("config auto-save serialization: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write_file(&path, &text) {
                        log::error!("config auto-save: {}", e);
                    }
                }
            });

        match spawned {
            Ok(worker) => *slot = Some(AutoSave { notify, worker }),
            Err(e) => log::error!("failed to spawn config auto-save worker: {}", e),
        }
    }

    /// Stop the auto-save worker, waiting for any pending write.
    pub fn disable_auto_save(&self) {
        let auto_save = self.auto_save.lock().unwrap().take();
        if let Some(AutoSave { notify, worker }) = auto_save {
            drop(notify);
            let _ = worker.join();
        }
    }
}

impl Drop for ConfigManager {
    fn drop(&mut self) {
        self.disable_auto_save();
    }
}

/// Write through a sibling temp file so readers never observe a partial document.
fn write_file(path: &Path, text: &str) -> Result<(), ConfigError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Locked view of the configuration document.
pub struct ConfigGuard<'a> {
    conf: MutexGuard<'a, Value>,
    modified: bool,
    notify: Option<Sender<()>>,
}

impl ConfigGuard<'_> {
    /// Flag the document as changed so the release triggers a save.
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }
}

impl Deref for ConfigGuard<'_> {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.conf
    }
}

impl DerefMut for ConfigGuard<'_> {
    fn deref_mut(&mut self) -> &mut Value {
        &mut self.conf
    }
}

impl Drop for ConfigGuard<'_> {
    fn drop(&mut self) {
        if self.modified {
            if let Some(ref notify) = self.notify {
                let _ = notify.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let config = ConfigManager::new(&path);
        config.load(json!({"device": ""})).unwrap();

        assert_eq!(read_json(&path), json!({"device": ""}));
        assert_eq!(config.acquire()["device"], json!(""));
    }

    #[test]
    fn test_load_keeps_existing_and_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"device": "1234"}"#).unwrap();

        let config = ConfigManager::new(&path);
        config.load(json!({"device": "", "devices": {}})).unwrap();

        let conf = config.acquire();
        assert_eq!(conf["device"], json!("1234"));
        assert_eq!(conf["devices"], json!({}));
    }

    #[test]
    fn test_load_resets_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, "{ not json").unwrap();

        let config = ConfigManager::new(&path);
        config.load(json!({"a": 1})).unwrap();
        assert_eq!(read_json(&path), json!({"a": 1}));
    }

    #[test]
    fn test_auto_save_after_modified_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let config = ConfigManager::new(&path);
        config.load(json!({})).unwrap();
        config.enable_auto_save();

        {
            let mut conf = config.acquire();
            conf["inst"] = json!({"port": 1234});
            conf.mark_modified();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while read_json(&path).get("inst").is_none() {
            assert!(Instant::now() < deadline, "auto-save never happened");
            std::thread::sleep(Duration::from_millis(5));
        }
        config.disable_auto_save();
        assert_eq!(read_json(&path)["inst"]["port"], json!(1234));
    }

    #[test]
    fn test_unmodified_release_does_not_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        let config = ConfigManager::new(&path);
        config.load(json!({})).unwrap();
        config.enable_auto_save();

        {
            let mut conf = config.acquire();
            conf["scratch"] = json!(true);
        }
        config.disable_auto_save();
        assert!(read_json(&path).get("scratch").is_none());

        config.save().unwrap();
        assert_eq!(read_json(&path)["scratch"], json!(true));
    }
}
