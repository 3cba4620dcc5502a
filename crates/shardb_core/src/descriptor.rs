//! Persistent shard config and driver descriptors.
//!
//! All three records share one layout:
//!
//! ```text
//! | magic (4) | version (u16 LE) | body |
//! ```
//!
//! Strings in the body are `u16 LE` length-prefixed UTF-8; lists are a
//! `u32 LE` count followed by their strings.

use crate::driver::ViewSettings;
use crate::error::{CoreError, CoreResult};

/// Magic bytes of the shard config.
pub const CONFIG_MAGIC: [u8; 4] = *b"SHCF";
/// Magic bytes of a storage descriptor.
pub const STORAGE_MAGIC: [u8; 4] = *b"SHSD";
/// Magic bytes of a view descriptor.
pub const VIEW_MAGIC: [u8; 4] = *b"SHVD";
/// Current record version.
pub const DESCRIPTOR_VERSION: u16 = 1;

/// Storages and views that are set up in a shard, in setup order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardConfig {
    /// Storage identifiers.
    pub storages: Vec<String>,
    /// View identifiers.
    pub views: Vec<String>,
}

impl ShardConfig {
    /// Encodes the config.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = header(CONFIG_MAGIC);
        put_list(&mut buf, &self.storages);
        put_list(&mut buf, &self.views);
        buf
    }

    /// Decodes a config.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for a wrong magic, an unknown
    /// version or truncated data.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::open(data, CONFIG_MAGIC, "config")?;
        let storages = reader.list()?;
        let views = reader.list()?;
        reader.finish()?;
        Ok(Self { storages, views })
    }
}

/// Which driver backs a storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescriptor {
    /// Name of the storage factory.
    pub driver: String,
}

impl StorageDescriptor {
    /// A descriptor naming `driver`.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
        }
    }

    /// Encodes the descriptor.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = header(STORAGE_MAGIC);
        put_str(&mut buf, &self.driver);
        buf
    }

    /// Decodes a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for malformed data.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::open(data, STORAGE_MAGIC, "storage descriptor")?;
        let driver = reader.string()?;
        reader.finish()?;
        Ok(Self { driver })
    }
}

/// Which driver backs a view, and its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDescriptor {
    /// Name of the view factory.
    pub driver: String,
    /// Settings handed to the factory.
    pub settings: ViewSettings,
}

impl ViewDescriptor {
    /// A descriptor naming `driver`.
    pub fn new(driver: impl Into<String>, settings: ViewSettings) -> Self {
        Self {
            driver: driver.into(),
            settings,
        }
    }

    /// Encodes the descriptor.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = header(VIEW_MAGIC);
        put_str(&mut buf, &self.driver);
        put_str(&mut buf, &self.settings.base_storage);
        put_str(&mut buf, &self.settings.extractor);
        buf
    }

    /// Decodes a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for malformed data.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut reader = Reader::open(data, VIEW_MAGIC, "view descriptor")?;
        let driver = reader.string()?;
        let base_storage = reader.string()?;
        let extractor = reader.string()?;
        reader.finish()?;
        Ok(Self {
            driver,
            settings: ViewSettings::new(base_storage, extractor),
        })
    }
}

fn header(magic: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&DESCRIPTOR_VERSION.to_le_bytes());
    buf
}

// Identifiers are validated to fit a u16 before they reach disk.
fn put_str(buf: &mut Vec<u8>, value: &str) {
    let len = u16::try_from(value.len()).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&value.as_bytes()[..usize::from(len)]);
}

fn put_list(buf: &mut Vec<u8>, values: &[String]) {
    let count = u32::try_from(values.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&count.to_le_bytes());
    for value in values.iter().take(count as usize) {
        put_str(buf, value);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn open(data: &'a [u8], magic: [u8; 4], what: &'static str) -> CoreResult<Self> {
        let mut reader = Self { data, pos: 0, what };
        if reader.take(4)? != magic {
            return Err(CoreError::invalid_format(format!("invalid {what} magic")));
        }
        let version = u16::from_le_bytes([reader.byte()?, reader.byte()?]);
        if version > DESCRIPTOR_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported {what} version: {version}"
            )));
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| CoreError::invalid_format(format!("{} too short", self.what)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self) -> CoreResult<String> {
        let len = u16::from_le_bytes([self.byte()?, self.byte()?]);
        let bytes = self.take(usize::from(len))?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CoreError::invalid_format(format!("{} holds invalid UTF-8", self.what)))
    }

    fn list(&mut self) -> CoreResult<Vec<String>> {
        let raw = self.take(4)?;
        let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        (0..count).map(|_| self.string()).collect()
    }

    fn finish(&self) -> CoreResult<()> {
        if self.pos != self.data.len() {
            return Err(CoreError::invalid_format(format!(
                "{} has {} trailing bytes",
                self.what,
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}
