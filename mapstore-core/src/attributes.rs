//! Interned attribute (tag) names with stable 16-bit keys.
//!
//! The table file is plain UTF-8, one name per line. A name's key is its
//! line index plus [`KEY_OFFSET`]; keys below the offset are reserved. The
//! table only ever grows, and every new name rewrites the whole file through
//! a temporary file and a rename so a crash never leaves a torn table.

use anyhow::{Context, Result};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Key of the empty / absent attribute name
pub const NO_ATTRIBUTE: i16 = 0;

/// Key returned by [`AttributeTable::get_key`] for unknown names
pub const UNKNOWN_KEY: i16 = -1;

/// Key of the first name in the table
pub const KEY_OFFSET: i16 = 1;

/// Most names a table can hold
pub const MAX_NAMES: usize = (i16::MAX - KEY_OFFSET) as usize + 1;

#[derive(Debug, Default)]
struct Names {
    list: Vec<String>,
    keys: HashMap<String, i16>,
}

impl Names {
    fn push(&mut self, name: String) -> Result<i16> {
        if self.list.len() >= MAX_NAMES {
            anyhow::bail!("Attribute table is full: {} names exceeds the key range", MAX_NAMES);
        }
        // Bounded by MAX_NAMES above
        let key = self.list.len() as i16 + KEY_OFFSET;
        self.keys.entry(name.clone()).or_insert(key);
        self.list.push(name);
        Ok(key)
    }
}

/// Trims the name and strips embedded line breaks
fn normalize(name: &str) -> String {
    name.trim().chars().filter(|&c| c != '\n' && c != '\r').collect()
}

/// Persistent attribute name dictionary
#[derive(Debug)]
pub struct AttributeTable {
    path: PathBuf,
    names: RwLock<Names>,
}

impl AttributeTable {
    /// Opens the table at `path`, loading existing names
    ///
    /// A missing file is an empty table; the file is created on the first
    /// insertion.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, or holds more
    /// names than there are keys.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut names = Names::default();

        if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read attribute table: {}", path.display()))?;
            // Every line keeps its position, blank or not, so keys stay stable.
            // Repeats after normalizing resolve to their first line.
            for line in text.lines() {
                names.push(normalize(line))?;
            }
        }

        debug!("Loaded {} attribute names from {}", names.list.len(), path.display());
        Ok(Self { path, names: RwLock::new(names) })
    }

    /// Path of the table file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of names in the table
    pub fn len(&self) -> usize {
        self.names.read().list.len()
    }

    /// Whether the table holds no names
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the key for `name`, adding it to the table if needed
    ///
    /// Blank names map to [`NO_ATTRIBUTE`].
    ///
    /// # Errors
    ///
    /// Returns an error if the table is full or cannot be rewritten. A name
    /// that failed to persist is not kept.
    pub fn get_or_create_key(&self, name: &str) -> Result<i16> {
        let name = normalize(name);
        if name.is_empty() {
            return Ok(NO_ATTRIBUTE);
        }

        if let Some(&key) = self.names.read().keys.get(&name) {
            return Ok(key);
        }

        let mut names = self.names.write();
        // Another thread may have added it between the locks
        if let Some(&key) = names.keys.get(&name) {
            return Ok(key);
        }

        let key = names.push(name.clone())?;
        if let Err(e) = self.persist(&names.list) {
            names.list.pop();
            names.keys.remove(&name);
            return Err(e);
        }

        debug!("Attribute '{}' assigned key {}", name, key);
        Ok(key)
    }

    /// Returns the key for `name` without adding it
    ///
    /// Blank names map to [`NO_ATTRIBUTE`], unknown names to [`UNKNOWN_KEY`].
    pub fn get_key(&self, name: &str) -> i16 {
        let name = normalize(name);
        if name.is_empty() {
            return NO_ATTRIBUTE;
        }
        self.names.read().keys.get(&name).copied().unwrap_or(UNKNOWN_KEY)
    }

    /// Returns the name stored under `key`, or `None` for reserved and
    /// unassigned keys
    pub fn attribute_name(&self, key: i16) -> Option<String> {
        let index = usize::try_from(key.checked_sub(KEY_OFFSET)?).ok()?;
        self.names.read().list.get(index).cloned()
    }

    /// Rewrites the table file from `list`
    fn persist(&self, list: &[String]) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let file = File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            for name in list {
                writeln!(writer, "{}", name)?;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }

        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace attribute table {}", self.path.display()))?;
        Ok(())
    }
}
