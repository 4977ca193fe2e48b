//! Streaming record sources
//!
//! A source hands out fresh, ordered streams of [`Record`]s. Streams do not
//! support random access; the only size information is an optional length
//! hint.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::DatasetSpec;
use crate::error::{Error, Result};
use crate::io::JsonLines;

/// One raw unit of the dataset: a JSON object with arbitrary fields.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub type RecordStream = Box<dyn Iterator<Item = Result<Record>> + Send>;

pub trait RecordSource: Send + Sync {
    /// Open a new stream positioned at the first record.
    fn open(&self) -> Result<RecordStream>;

    /// Record count if the source knows it.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

impl<S: RecordSource + ?Sized> RecordSource for Arc<S> {
    fn open(&self) -> Result<RecordStream> {
        (**self).open()
    }

    fn len_hint(&self) -> Option<usize> {
        (**self).len_hint()
    }
}

/// Records held in memory. Length is known.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Arc<Vec<Record>>,
}

impl MemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    /// Build records with a single text field.
    pub fn from_texts<S: AsRef<str>>(field: &str, texts: &[S]) -> Self {
        let records = texts
            .iter()
            .map(|text| {
                let mut record = Record::new();
                record.insert(field.to_string(), text.as_ref().into());
                record
            })
            .collect();
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for MemorySource {
    fn open(&self) -> Result<RecordStream> {
        let records = Arc::clone(&self.records);
        Ok(Box::new(
            (0..records.len()).map(move |i| Ok::<_, Error>(records[i].clone())),
        ))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.records.len())
    }
}

/// JSONL files resolved from a [`DatasetSpec`], streamed one after another.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    files: Vec<PathBuf>,
}

impl JsonlSource {
    pub fn new(spec: &DatasetSpec) -> Result<Self> {
        let mut root = PathBuf::from(&spec.path);
        if let Some(dir) = &spec.data_dir {
            root = root.join(dir);
        }

        let files = if root.is_file() {
            vec![root.clone()]
        } else if !spec.data_files.is_empty() {
            spec.data_files
                .iter()
                .map(|name| {
                    let path = root.join(name);
                    if path.is_file() {
                        Ok(path)
                    } else {
                        Err(Error::Source(format!(
                            "data file {} does not exist",
                            path.display()
                        )))
                    }
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            split_files(&root, &spec.split)?
        };

        if files.is_empty() {
            return Err(Error::Source(format!(
                "no '{}' files found under {}",
                spec.split,
                root.display()
            )));
        }

        debug!("Resolved {} file(s) for split '{}'", files.len(), spec.split);
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

fn is_jsonl(name: &str) -> bool {
    [".jsonl", ".json", ".jsonl.gz", ".jsonl.zst", ".jsonl.zstd"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

fn split_files(root: &Path, split: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)
        .map_err(|e| Error::Source(format!("cannot list {}: {}", root.display(), e)))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && name.starts_with(split) && is_jsonl(name) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl RecordSource for JsonlSource {
    fn open(&self) -> Result<RecordStream> {
        let files = self.files.clone();
        let stream = files
            .into_iter()
            .flat_map(|path| -> Box<dyn Iterator<Item = Result<Record>> + Send> {
                match JsonLines::open(&path) {
                    Ok(lines) => Box::new(lines),
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            });
        Ok(Box::new(stream))
    }
}

/// Buffered shuffle of a stream.
///
/// Fills a buffer of `buffer_size` records, then for each incoming record
/// yields a random buffered one and takes its place. The same seed over the
/// same stream always produces the same order.
pub struct ShuffledStream {
    inner: RecordStream,
    buffer: Vec<Record>,
    buffer_size: usize,
    rng: StdRng,
    exhausted: bool,
}

impl ShuffledStream {
    pub fn new(inner: RecordStream, buffer_size: usize, seed: u64) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            rng: StdRng::seed_from_u64(seed),
            exhausted: false,
        }
    }
}

impl Iterator for ShuffledStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted && self.buffer.len() < self.buffer_size {
            match self.inner.next() {
                Some(Ok(record)) => self.buffer.push(record),
                Some(Err(e)) => return Some(Err(e)),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            return None;
        }

        let idx = self.rng.random_range(0..self.buffer.len());
        if !self.exhausted {
            match self.inner.next() {
                Some(Ok(record)) => {
                    return Some(Ok(std::mem::replace(&mut self.buffer[idx], record)));
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.exhausted = true,
            }
        }
        Some(Ok(self.buffer.swap_remove(idx)))
    }
}
