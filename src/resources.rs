use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};

const SCRIPT_EXTENSION: &str = ".js";

/// Turns a source identifier into content. `Ok(None)` means not found.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<Option<String>>;
}

/// Sources are identified without their `.js` suffix, so both spellings are
/// tried.
fn candidates(path: &str) -> Vec<String> {
    let path = path.replace('\\', "/");
    if path.ends_with(SCRIPT_EXTENSION) {
        vec![path]
    } else {
        vec![path.clone(), format!("{path}{SCRIPT_EXTENSION}")]
    }
}

/// Serves resources from a directory on disk.
#[derive(Debug, Clone)]
pub struct FileResolver {
    root: PathBuf,
}

impl FileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!("resource path '{path}' escapes the resource root");
        }
        Ok(self.root.join(relative))
    }
}

impl ResourceResolver for FileResolver {
    fn resolve(&self, path: &str) -> Result<Option<String>> {
        for candidate in candidates(path) {
            let location = self.locate(&candidate)?;
            if location.is_file() {
                let content = fs::read_to_string(&location)
                    .with_context(|| format!("failed to read {}", location.display()))?;
                return Ok(Some(content));
            }
        }
        Ok(None)
    }
}

/// Resources held in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemoryResolver {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, path: &str, content: &str) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&self, path: &str, content: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.trim_start_matches('/').to_string(), content.to_string());
    }
}

impl ResourceResolver for MemoryResolver {
    fn resolve(&self, path: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(candidates(path)
            .iter()
            .find_map(|candidate| entries.get(candidate.trim_start_matches('/')).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_resolver_adds_script_extension() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("views")).unwrap();
        fs::write(dir.path().join("views/counter.js"), "var x = 1;").unwrap();

        let resolver = FileResolver::new(dir.path());
        assert_eq!(
            resolver.resolve("/views/counter").unwrap().as_deref(),
            Some("var x = 1;")
        );
        assert_eq!(
            resolver.resolve("views\\counter.js").unwrap().as_deref(),
            Some("var x = 1;")
        );
        assert_eq!(resolver.resolve("views/missing").unwrap(), None);
        assert!(resolver.resolve("../etc/passwd").is_err());
    }

    #[test]
    fn memory_resolver_lookup() {
        let resolver = MemoryResolver::new().with("/app/main.js", "main()");
        assert_eq!(resolver.resolve("app/main").unwrap().as_deref(), Some("main()"));
        assert_eq!(resolver.resolve("/app/main.js").unwrap().as_deref(), Some("main()"));
        assert_eq!(resolver.resolve("app/other").unwrap(), None);
    }
}
