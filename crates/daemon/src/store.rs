//! Pairing record persistence
//!
//! The client engine reads and writes pairing records through
//! [`PairRecordStore`]. Failures travel as `io::Error` and reach clients as
//! the raw errno they carry.

use nix::errno::Errno;
use plist::{Dictionary, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// File holding daemon-wide settings, including the BUID
const SYSTEM_CONFIG_FILE: &str = "SystemConfiguration.plist";

const SYSTEM_BUID_KEY: &str = "SystemBUID";

/// Persistent storage consumed by the client engine
pub trait PairRecordStore: Send + Sync {
    /// The daemon's persistent unique id
    fn system_buid(&self) -> io::Result<String>;

    /// Record bytes for `record_id`, or `None` when there is no such record
    fn read_record(&self, record_id: &str) -> io::Result<Option<Vec<u8>>>;

    fn save_record(&self, record_id: &str, data: &[u8]) -> io::Result<()>;

    fn delete_record(&self, record_id: &str) -> io::Result<()>;
}

/// Numeric error reported to clients for a store failure
pub fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(Errno::EIO as i32)
}

/// Store keeping one `<id>.plist` file per record in a directory
#[derive(Debug)]
pub struct FilePairRecordStore {
    dir: PathBuf,
    buid: Mutex<Option<String>>,
}

impl FilePairRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            buid: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, record_id: &str) -> io::Result<PathBuf> {
        if record_id.is_empty() || record_id.contains('/') || record_id.contains("..") {
            warn!("Rejecting pair record id {:?}", record_id);
            return Err(io::Error::from_raw_os_error(Errno::EINVAL as i32));
        }
        Ok(self.dir.join(format!("{}.plist", record_id)))
    }

    fn system_config_path(&self) -> PathBuf {
        self.dir.join(SYSTEM_CONFIG_FILE)
    }

    /// Read the system configuration dictionary, empty if the file is missing
    fn load_system_config(&self) -> io::Result<Dictionary> {
        let path = self.system_config_path();
        if !path.exists() {
            return Ok(Dictionary::new());
        }
        let value = Value::from_file(&path).map_err(plist_to_io)?;
        Ok(value.into_dictionary().unwrap_or_default())
    }

    fn store_system_config(&self, config: Dictionary) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        Value::Dictionary(config)
            .to_file_xml(self.system_config_path())
            .map_err(plist_to_io)
    }
}

impl PairRecordStore for FilePairRecordStore {
    fn system_buid(&self) -> io::Result<String> {
        let mut cached = self.buid.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(buid) = cached.as_ref() {
            return Ok(buid.clone());
        }

        let mut config = self.load_system_config()?;
        let buid = match config.get(SYSTEM_BUID_KEY).and_then(Value::as_string) {
            Some(existing) => existing.to_string(),
            None => {
                let generated = generate_buid();
                info!("Generated new system BUID {}", generated);
                config.insert(SYSTEM_BUID_KEY.to_string(), Value::String(generated.clone()));
                self.store_system_config(config)?;
                generated
            }
        };

        *cached = Some(buid.clone());
        Ok(buid)
    }

    fn read_record(&self, record_id: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.record_path(record_id)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No pair record for {}", record_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn save_record(&self, record_id: &str, data: &[u8]) -> io::Result<()> {
        let path = self.record_path(record_id)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, data)?;
        info!("Saved pair record for {} ({} bytes)", record_id, data.len());
        Ok(())
    }

    fn delete_record(&self, record_id: &str) -> io::Result<()> {
        let path = self.record_path(record_id)?;
        fs::remove_file(&path)?;
        info!("Deleted pair record for {}", record_id);
        Ok(())
    }
}

fn plist_to_io(err: plist::Error) -> io::Error {
    err.into_io()
        .unwrap_or_else(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Random upper-case UUID string
fn generate_buid() -> String {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
