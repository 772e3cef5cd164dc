//! On-disk cache of fetched rendering-library scripts.

use std::{fs, path::PathBuf};

use anyhow::Result;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct ScriptCache {
    length: usize,
    cache_path: PathBuf,
}

impl ScriptCache {
    pub fn from_config(cfg: &Config) -> Self {
        Self::at(cfg.cache_path(), cfg.cache_length())
    }

    pub fn at(cache_path: PathBuf, length: usize) -> Self {
        let _ = fs::create_dir_all(&cache_path);
        Self { length, cache_path }
    }

    pub fn key_for(&self, url: &str) -> String {
        let digest = md5::compute(url.as_bytes());
        format!("{:x}", digest)
    }

    pub fn get(&self, url: &str) -> Option<String> {
        let p = self.cache_path.join(self.key_for(url));
        fs::read_to_string(p).ok()
    }

    pub fn set(&self, url: &str, value: &str) -> Result<()> {
        let p = self.cache_path.join(self.key_for(url));
        fs::write(p, value)?;
        self.prune()?;
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(&self.cache_path)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
        if entries.len() > self.length {
            let to_delete = entries.len() - self.length;
            for entry in entries.iter().take(to_delete) {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}
