// Copyright 2025-2026 CEMAXECUTER LLC

//! Loadable module lifecycle: init, create instance, delete instance, end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ConfigError;

/// Static description of a module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub author: &'static str,
    pub version: (u8, u8, u8),
    /// Negative means unlimited.
    pub max_instances: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),

    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("module '{module}' allows at most {max} instance(s)")]
    TooManyInstances { module: String, max: i32 },

    #[error("module config: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

/// A live module instance. Teardown happens on drop.
pub trait Instance: Send {
    /// Called once every module has been created.
    fn post_init(&mut self) {}

    fn enable(&mut self);

    fn disable(&mut self);

    fn is_enabled(&self) -> bool;
}

/// Entry points a loadable module exposes to the host.
pub trait Module: Send {
    fn info(&self) -> &ModuleInfo;

    /// One-time setup; `root` is the host's configuration directory.
    fn init(&mut self, root: &Path) -> Result<(), ModuleError>;

    fn create_instance(&mut self, name: &str) -> Result<Box<dyn Instance>, ModuleError>;

    /// Final teardown after every instance was dropped.
    fn end(&mut self);
}

struct LoadedInstance {
    module: String,
    instance: Box<dyn Instance>,
}

/// Owns modules and their instances for the lifetime of the host.
pub struct ModuleManager {
    root: PathBuf,
    modules: HashMap<String, Box<dyn Module>>,
    instances: HashMap<String, LoadedInstance>,
}

impl ModuleManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        crate::logging::init();
        Self {
            root: root.into(),
            modules: HashMap::new(),
            instances: HashMap::new(),
        }
    }

    /// Register a module and run its init entry point.
    pub fn load(&mut self, mut module: Box<dyn Module>) -> Result<(), ModuleError> {
        let name = module.info().name.to_string();
        if self.modules.contains_key(&name) {
            return Err(ModuleError::DuplicateModule(name));
        }
        module.init(&self.root)?;
        let info = module.info();
        log::info!(
            "loaded module {} v{}.{}.{} ({})",
            name,
            info.version.0,
            info.version.1,
            info.version.2,
            info.description
        );
        self.modules.insert(name, module);
        Ok(())
    }

    pub fn create_instance(&mut self, module: &str, name: &str) -> Result<(), ModuleError> {
        if self.instances.contains_key(name) {
            return Err(ModuleError::DuplicateInstance(name.to_string()));
        }
        let loaded = self
            .modules
            .get_mut(module)
            .ok_or_else(|| ModuleError::UnknownModule(module.to_string()))?;

        let max = loaded.info().max_instances;
        if max >= 0 {
            let count = self.instances.values().filter(|i| i.module == module).count();
            if count >= max as usize {
                return Err(ModuleError::TooManyInstances {
                    module: module.to_string(),
                    max,
                });
            }
        }

        let mut instance = loaded.create_instance(name)?;
        instance.post_init();
        log::info!("created instance '{}' of module {}", name, module);
        self.instances.insert(
            name.to_string(),
            LoadedInstance {
                module: module.to_string(),
                instance,
            },
        );
        Ok(())
    }

    pub fn delete_instance(&mut self, name: &str) -> Result<(), ModuleError> {
        match self.instances.remove(name) {
            Some(_) => {
                log::info!("deleted instance '{}'", name);
                Ok(())
            }
            None => Err(ModuleError::UnknownInstance(name.to_string())),
        }
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut (dyn Instance + 'static)> {
        self.instances.get_mut(name).map(|i| i.instance.as_mut())
    }

    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every instance, then end every module.
    pub fn end(&mut self) {
        self.instances.clear();
        for (name, module) in self.modules.iter_mut() {
            module.end();
            log::debug!("module {} ended", name);
        }
        self.modules.clear();
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counters {
        created: AtomicUsize,
        post_init: AtomicUsize,
        dropped: AtomicUsize,
        ended: AtomicUsize,
    }

    struct TestInstance {
        counters: Arc<Counters>,
        enabled: bool,
    }

    impl Instance for TestInstance {
        fn post_init(&mut self) {
            self.counters.post_init.fetch_add(1, Ordering::SeqCst);
        }
        fn enable(&mut self) {
            self.enabled = true;
        }
        fn disable(&mut self) {
            self.enabled = false;
        }
        fn is_enabled(&self) -> bool {
            self.enabled
        }
    }

    impl Drop for TestInstance {
        fn drop(&mut self) {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestModule {
        info: ModuleInfo,
        counters: Arc<Counters>,
    }

    impl Module for TestModule {
        fn info(&self) -> &ModuleInfo {
            &self.info
        }
        fn init(&mut self, _root: &Path) -> Result<(), ModuleError> {
            Ok(())
        }
        fn create_instance(&mut self, _name: &str) -> Result<Box<dyn Instance>, ModuleError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestInstance {
                counters: Arc::clone(&self.counters),
                enabled: true,
            }))
        }
        fn end(&mut self) {
            self.counters.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_module(max_instances: i32) -> (Box<TestModule>, Arc<Counters>) {
        let counters = Arc::new(Counters {
            created: AtomicUsize::new(0),
            post_init: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        let module = Box::new(TestModule {
            info: ModuleInfo {
                name: "test",
                description: "test module",
                author: "nobody",
                version: (0, 1, 0),
                max_instances,
            },
            counters: Arc::clone(&counters),
        });
        (module, counters)
    }

    #[test]
    fn test_instance_lifecycle() {
        let (module, counters) = test_module(-1);
        let mut mgr = ModuleManager::new(std::env::temp_dir());
        mgr.load(module).unwrap();

        mgr.create_instance("test", "a").unwrap();
        mgr.create_instance("test", "b").unwrap();
        assert_eq!(mgr.instance_names(), vec!["a", "b"]);
        assert_eq!(counters.post_init.load(Ordering::SeqCst), 2);

        let inst = mgr.instance_mut("a").unwrap();
        inst.disable();
        assert!(!inst.is_enabled());

        mgr.delete_instance("a").unwrap();
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);

        mgr.end();
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 2);
        assert_eq!(counters.ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_max_instances_enforced() {
        let (module, counters) = test_module(1);
        let mut mgr = ModuleManager::new(std::env::temp_dir());
        mgr.load(module).unwrap();

        mgr.create_instance("test", "only").unwrap();
        assert!(matches!(
            mgr.create_instance("test", "second"),
            Err(ModuleError::TooManyInstances { max: 1, .. })
        ));
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_and_unknown_names() {
        let (module, _) = test_module(-1);
        let mut mgr = ModuleManager::new(std::env::temp_dir());
        mgr.load(module).unwrap();

        mgr.create_instance("test", "a").unwrap();
        assert!(matches!(
            mgr.create_instance("test", "a"),
            Err(ModuleError::DuplicateInstance(_))
        ));
        assert!(matches!(
            mgr.create_instance("missing", "b"),
            Err(ModuleError::UnknownModule(_))
        ));
        assert!(matches!(
            mgr.delete_instance("nope"),
            Err(ModuleError::UnknownInstance(_))
        ));
    }
}
