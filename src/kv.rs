//! Flat `key="value"` record files shared by instances and native blueprints.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use crate::error::{AppError, Result};

/// Ordered key/value pairs as read from or written to a record file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvRecord {
    entries: Vec<(String, String)>,
}

impl KvRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse record text. Blank lines and `#` comments are skipped; values may be
    /// wrapped in single or double quotes.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut record = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected key=value", idx + 1))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("line {}: empty key", idx + 1));
            }
            record.set(key, unquote(value.trim()));
        }
        Ok(record)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| AppError::io(format!("Failed to read {:?}: {}", path, e)))?;
        Self::parse(&text).map_err(|e| AppError::invalid_record(&path.display().to_string(), e))
    }

    /// Write via a sibling temp file and rename so readers never see a torn record.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", tmp, e)))?;
            file.write_all(self.render().as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
            .map_err(|e| AppError::io(format!("Failed to replace {:?}: {}", path, e)))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&value.replace('"', "\\\""));
            out.push_str("\"\n");
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value for `key`, treating an empty string as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn unquote(value: &str) -> String {
    let stripped = if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        &value[1..value.len() - 1]
    } else {
        value
    };
    stripped.replace("\\\"", "\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_values() {
        let record = KvRecord::parse(
            "# comment\n\nname=\"valheim\"\nports='2456:2458/udp'\nexecutable_file=valheim_server.x86_64\n",
        )
        .unwrap();
        assert_eq!(record.get("name"), Some("valheim"));
        assert_eq!(record.get("ports"), Some("2456:2458/udp"));
        assert_eq!(record.get("executable_file"), Some("valheim_server.x86_64"));
        assert_eq!(record.get("missing"), None);
    }

    #[test]
    fn rejects_lines_without_separator() {
        assert!(KvRecord::parse("name=ok\ngarbage\n").is_err());
    }

    #[test]
    fn set_replaces_in_place_and_keeps_order() {
        let mut record = KvRecord::new();
        record.set("a", "1");
        record.set("b", "2");
        record.set("a", "3");
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(record.get("a"), Some("3"));
    }

    #[test]
    fn written_record_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rec.ini");
        let mut record = KvRecord::new();
        record.set("executable_arguments", "-name \"My Server\" -port 2456");
        record.write(&path).unwrap();
        let back = KvRecord::read(&path).unwrap();
        assert_eq!(back, record);
    }
}
