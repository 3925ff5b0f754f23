//! Persisted variable store (`variables.yaml`).

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use crate::error::{NimbusError, Result};

#[derive(Debug)]
pub struct Variables {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl Variables {
    /// Loads the store. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let raw: Option<BTreeMap<String, String>> = serde_yaml::from_reader(File::open(&path)?)?;
            raw.unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Like `get`, but a missing or empty value is an error naming the file.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| NimbusError::MissingVariable {
            name: name.to_string(),
            file: self.path.clone(),
        })
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        serde_yaml::to_writer(File::create(&self.path)?, &self.values)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_reports_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variables.yaml");
        std::fs::write(&path, "DIGITALOCEAN_CLIENT_ID: abc\nDIGITALOCEAN_API_KEY: ''\n").unwrap();
        let variables = Variables::load(&path).unwrap();

        assert_eq!(variables.require("DIGITALOCEAN_CLIENT_ID").unwrap(), "abc");
        match variables.require("DIGITALOCEAN_API_KEY") {
            Err(NimbusError::MissingVariable { name, file }) => {
                assert_eq!(name, "DIGITALOCEAN_API_KEY");
                assert_eq!(file, path);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_set_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("variables.yaml");
        let mut variables = Variables::load(&path).unwrap();
        variables.set("TOKEN", "t0k3n");
        variables.save().unwrap();

        assert_eq!(Variables::load(&path).unwrap().get("TOKEN"), Some("t0k3n"));
    }
}
