use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::{empty_object, validate_key, InstallationId, IntegrationStore, StoreError};

/// One directory per installation under `dump_path`, one JSON file per key.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dump_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dump_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dump_path = dump_path.into();
        fs::create_dir_all(&dump_path)?;
        Ok(Self { dump_path })
    }

    pub fn dump_path(&self) -> &Path {
        &self.dump_path
    }

    fn installation_dir(&self, installation: InstallationId) -> PathBuf {
        self.dump_path.join(installation.to_string())
    }

    fn key_path(&self, installation: InstallationId, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.installation_dir(installation).join(key))
    }
}

impl IntegrationStore for JsonFileStore {
    fn list_installations(
        &self,
    ) -> Result<Box<dyn Iterator<Item = InstallationId> + '_>, StoreError> {
        let dump_path = self.dump_path.as_path();
        let entries = fs::read_dir(dump_path)?;
        let iter = entries.filter_map(move |entry| {
            let entry = entry.ok()?;
            if !entry.file_type().ok()?.is_dir() {
                return None;
            }
            let name = entry.file_name();
            let installation = name.to_str()?.parse::<InstallationId>().ok()?;
            debug!("found installation {} in {}", installation, dump_path.display());
            Some(installation)
        });
        Ok(Box::new(iter))
    }

    fn get(&self, installation: InstallationId, key: &str) -> Result<Value, StoreError> {
        let path = self.key_path(installation, key)?;
        if !path.is_file() {
            return Ok(empty_object());
        }
        debug!("loading json from {}", path.display());
        let contents = fs::read(&path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    fn write(
        &self,
        installation: InstallationId,
        key: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        let path = self.key_path(installation, key)?;
        let parent = self.installation_dir(installation);
        if !parent.is_dir() {
            debug!("creating {} for installation data", parent.display());
            fs::create_dir_all(&parent)?;
        }

        // Readers only ever see the old file or the complete new one.
        let tmp_path = parent.join(format!(".{}.tmp", key));
        {
            let mut file = fs::File::create(&tmp_path)?;
            serde_json::to_writer(&mut file, data)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        debug!("dumped json to {}", path.display());
        Ok(())
    }

    fn remove(&self, installation: InstallationId, key: &str) -> Result<(), StoreError> {
        let path = self.key_path(installation, key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("removed {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
