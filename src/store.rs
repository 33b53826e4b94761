//! Deduplicating, append-only lead sink.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ScrapeError, ScrapeResult};
use crate::extractor::LeadRecord;

pub const CSV_HEADER: [&str; 4] = ["Name", "Phone", "Website", "Address"];

/// Which fields identify "the same business".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupKey {
    #[default]
    Name,
    /// For directories that reuse a trading name across branches
    NameAndAddress,
}

impl FromStr for DedupKey {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "name" => Ok(DedupKey::Name),
            "name_address" | "name+address" | "nameandaddress" => Ok(DedupKey::NameAndAddress),
            other => Err(ScrapeError::Config(format!(
                "unknown dedup key '{}' (expected 'name' or 'name_address')",
                other
            ))),
        }
    }
}

impl DedupKey {
    pub fn key_for(&self, record: &LeadRecord) -> String {
        match self {
            DedupKey::Name => normalize(&record.name),
            DedupKey::NameAndAddress => format!("{}|{}", normalize(&record.name), normalize(&record.address)),
        }
    }
}

/// Trim, collapse inner whitespace and case-fold.
pub fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Written and flushed; `count` is the number of records accepted so far
    Accepted { count: usize },
    Duplicate,
}

/// Keeps the set of keys seen this run and the sink they guard.
pub struct LeadStore<W: Write> {
    sink: W,
    seen: HashSet<String>,
    policy: DedupKey,
    /// Set once a write failed; the sink may hold a partial row after that
    poisoned: bool,
}

impl LeadStore<File> {
    /// Truncate (or create) `path` and write the header row.
    pub fn create(path: impl AsRef<Path>, policy: DedupKey) -> ScrapeResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        debug!("Opened lead sink at {}", path.display());
        Self::from_writer(file, policy)
    }
}

impl<W: Write> LeadStore<W> {
    pub fn from_writer(sink: W, policy: DedupKey) -> ScrapeResult<Self> {
        let mut store = Self {
            sink,
            seen: HashSet::new(),
            policy,
            poisoned: false,
        };
        store.append(CSV_HEADER)?;
        Ok(store)
    }

    /// Accept and persist `record` unless its key was already seen.
    ///
    /// The row is flushed before the key is recorded. A failed write leaves the
    /// key set unchanged and poisons the store: every later `offer` fails too.
    pub fn offer(&mut self, record: &LeadRecord) -> ScrapeResult<Offer> {
        let key = self.policy.key_for(record);
        if self.seen.contains(&key) {
            return Ok(Offer::Duplicate);
        }

        self.append([
            record.name.as_str(),
            record.phone.as_str(),
            record.website.as_str(),
            record.address.as_str(),
        ])?;

        self.seen.insert(key);
        Ok(Offer::Accepted { count: self.seen.len() })
    }

    /// Encode one row on its own, then hand the bytes to the sink and flush.
    fn append(&mut self, fields: [&str; 4]) -> ScrapeResult<()> {
        if self.poisoned {
            return Err(ScrapeError::Io(io::Error::new(
                io::ErrorKind::Other,
                "lead sink unusable after an earlier write failure",
            )));
        }

        let mut row = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        row.write_record(fields)?;
        let bytes = row.into_inner().map_err(|e| ScrapeError::Io(e.into_error()))?;

        let written = self.sink.write_all(&bytes).and_then(|_| self.sink.flush());
        if let Err(e) = written {
            self.poisoned = true;
            return Err(ScrapeError::Io(e));
        }
        Ok(())
    }

    pub fn is_seen(&self, record: &LeadRecord) -> bool {
        self.seen.contains(&self.policy.key_for(record))
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }
}
