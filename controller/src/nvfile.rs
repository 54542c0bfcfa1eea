use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{info, warn};

use opentrv_common::nvstore::{layout, NvStore, ERASED_BYTE};

/// Non-volatile store image kept in a file, rewritten on every physical write.
#[derive(Debug)]
pub struct FileNvStore {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FileNvStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no store image at {}, starting erased", path.display());
                Vec::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if bytes.len() != layout::SIZE {
            if !bytes.is_empty() {
                warn!(
                    "store image {} is {} bytes, expected {}",
                    path.display(),
                    bytes.len(),
                    layout::SIZE
                );
            }
            bytes.resize(layout::SIZE, ERASED_BYTE);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self { path, bytes })
    }

    fn flush(&self) {
        if let Err(err) = std::fs::write(&self.path, &self.bytes) {
            warn!("store write to {} failed: {err}", self.path.display());
        }
    }
}

impl NvStore for FileNvStore {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read_byte(&self, addr: usize) -> u8 {
        self.bytes.get(addr).copied().unwrap_or(ERASED_BYTE)
    }

    fn write_if_changed(&mut self, addr: usize, value: u8) -> bool {
        let Some(slot) = self.bytes.get_mut(addr) else {
            warn!("store write past end at {addr}");
            return false;
        };
        if *slot == value {
            return false;
        }
        *slot = value;
        self.flush();
        true
    }
}

#[cfg(test)]
mod tests {
    use opentrv_common::SettingsStore;

    use super::*;

    #[test]
    fn settings_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("opentrv-nv-{}", std::process::id()));
        let path = dir.join("eeprom.bin");
        let _ = std::fs::remove_file(&path);

        let mut nv = FileNvStore::open(&path).unwrap();
        assert_eq!(nv.read_byte(layout::FROST_C), ERASED_BYTE);
        assert!(nv.set_frost_target_c(9));
        assert!(!nv.write_if_changed(layout::FROST_C, 9));

        let reopened = FileNvStore::open(&path).unwrap();
        assert_eq!(reopened.frost_target_c(), 9);
        assert_eq!(reopened.len(), layout::SIZE);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
