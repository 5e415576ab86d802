//! The config store contract (§6) and a filesystem-backed implementation,
//! grounded in the original daemon's `conf.cpp`: one `SystemConfiguration.plist`
//! holding `SystemBUID`, plus one `<UDID>.plist` pair record per paired device.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use plist::Value;

use crate::error::ConfigStoreError;
use crate::util::pair_record_file_name;

const SYSTEM_BUID_KEY: &str = "SystemBUID";
const SYSTEM_CONFIG_FILE: &str = "SystemConfiguration.plist";

/// The config store contract, §6. A device's pair record is opaque binary
/// data to the core; only the store needs to know it is itself a plist.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_system_buid(&self) -> Result<String, ConfigStoreError>;
    async fn has_device_record(&self, udid: &str) -> bool;
    async fn get_device_record(&self, udid: &str) -> Result<Vec<u8>, ConfigStoreError>;
    async fn set_device_record(&self, udid: &str, record: &[u8]) -> Result<(), ConfigStoreError>;
    async fn remove_device_record(&self, udid: &str) -> Result<(), ConfigStoreError>;
    /// Extracts the `HostID` field from a stored pair record, used to
    /// answer `ReadPairRecord` without a full round trip through the client.
    async fn get_device_record_host_id(&self, udid: &str) -> Result<Option<String>, ConfigStoreError>;
}

/// Filesystem-backed store rooted at a single config directory (the
/// daemon's `lockdown` directory equivalent).
pub struct FsConfigStore {
    root: PathBuf,
}

impl FsConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn system_config_path(&self) -> PathBuf {
        self.root.join(SYSTEM_CONFIG_FILE)
    }

    fn device_record_path(&self, udid: &str) -> PathBuf {
        self.root.join(pair_record_file_name(udid))
    }

    async fn ensure_root_dir(&self) -> Result<(), ConfigStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn read_plist_dict(path: &Path) -> Result<Option<plist::Dictionary>, ConfigStoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = decode_plist_bytes(&bytes)?;
                Ok(value.into_dictionary())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_plist_dict(path: &Path, dict: plist::Dictionary) -> Result<(), ConfigStoreError> {
        let mut buf = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut buf)?;
        tokio::fs::write(path, buf).await?;
        Ok(())
    }
}

/// Decodes a plist from bytes, auto-detecting binary (`bplist00` magic)
/// vs. XML form, matching the way the daemon's libplist dependency
/// transparently accepts either.
fn decode_plist_bytes(bytes: &[u8]) -> Result<Value, ConfigStoreError> {
    Ok(Value::from_reader(std::io::Cursor::new(bytes))?)
}

#[async_trait]
impl ConfigStore for FsConfigStore {
    async fn get_system_buid(&self) -> Result<String, ConfigStoreError> {
        let path = self.system_config_path();
        if let Some(dict) = Self::read_plist_dict(&path).await? {
            if let Some(Value::String(buid)) = dict.get(SYSTEM_BUID_KEY) {
                return Ok(buid.clone());
            }
        }

        self.ensure_root_dir().await?;
        let buid = uuid::Uuid::new_v4().to_string().to_uppercase();
        let mut dict = plist::Dictionary::new();
        dict.insert(SYSTEM_BUID_KEY.to_string(), Value::String(buid.clone()));
        Self::write_plist_dict(&path, dict).await?;
        Ok(buid)
    }

    async fn has_device_record(&self, udid: &str) -> bool {
        tokio::fs::metadata(self.device_record_path(udid))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn get_device_record(&self, udid: &str) -> Result<Vec<u8>, ConfigStoreError> {
        match tokio::fs::read(self.device_record_path(udid)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ConfigStoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_device_record(&self, udid: &str, record: &[u8]) -> Result<(), ConfigStoreError> {
        self.ensure_root_dir().await?;
        tokio::fs::write(self.device_record_path(udid), record).await?;
        Ok(())
    }

    async fn remove_device_record(&self, udid: &str) -> Result<(), ConfigStoreError> {
        match tokio::fs::remove_file(self.device_record_path(udid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ConfigStoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_device_record_host_id(&self, udid: &str) -> Result<Option<String>, ConfigStoreError> {
        let bytes = self.get_device_record(udid).await?;
        let value = decode_plist_bytes(&bytes)?;
        let dict = value.as_dictionary().ok_or(ConfigStoreError::MissingKey("HostID"))?;
        Ok(dict.get("HostID").and_then(|v| v.as_string()).map(str::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_buid_is_generated_once_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());

        let first = store.get_system_buid().await.unwrap();
        let second = store.get_system_buid().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 36);
    }

    #[tokio::test]
    async fn device_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let udid = "0123456789ABCDEF0123456789ABCDEF01234567";

        assert!(!store.has_device_record(udid).await);

        let mut dict = plist::Dictionary::new();
        dict.insert("HostID".to_string(), Value::String("HOST-UUID".to_string()));
        let mut body = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();

        store.set_device_record(udid, &body).await.unwrap();
        assert!(store.has_device_record(udid).await);
        assert_eq!(store.get_device_record(udid).await.unwrap(), body);
        assert_eq!(
            store.get_device_record_host_id(udid).await.unwrap(),
            Some("HOST-UUID".to_string())
        );

        store.remove_device_record(udid).await.unwrap();
        assert!(!store.has_device_record(udid).await);
    }

    #[tokio::test]
    async fn missing_device_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());
        let err = store.get_device_record("missing").await.unwrap_err();
        assert!(matches!(err, ConfigStoreError::NotFound));
    }
}
