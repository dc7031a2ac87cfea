//! The archive writer the engine hands samples to.
//!
//! The engine only ever talks to [`Archive`] and [`Segment`]; it never looks at how
//! samples are laid out on disk. It does promise that the `index` passed to
//! [`Segment::append`] is the true count of logical samples written to that segment so
//! far, so the archive can place them at the right time.

use std::{
    cell::RefCell,
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use crate::{error::ArchiveError, format::SampleFormat};

/// Everything needed to open one time-addressable segment
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentSpec {
    /// Channel name, unique per engine
    pub name: String,
    /// Absolute sample index of local index 0
    pub start_index: u64,
    pub sample_rate: f64,
    pub format: SampleFormat,
    /// Opaque id pairing this data with co-recorded metadata
    pub identifier: String,
}

pub trait Archive {
    type Segment: Segment;

    fn open(&mut self, spec: &SegmentSpec) -> Result<Self::Segment, ArchiveError>;
}

pub trait Segment {
    /// Write `count` samples from `buf` starting at local sample `index`
    fn append(&mut self, index: u64, buf: &[u8], count: u64) -> Result<(), ArchiveError>;

    fn close(&mut self) -> Result<(), ArchiveError>;
}

/// Tracks the next free index so nobody can write backwards
#[derive(Clone, Copy, Debug, Default)]
struct IndexGuard {
    next: u64,
}

impl IndexGuard {
    fn check(&mut self, index: u64, count: u64) -> Result<(), ArchiveError> {
        if index < self.next {
            return Err(ArchiveError::OutOfOrder {
                expected: self.next,
                got: index,
            });
        }
        self.next = index + count;
        Ok(())
    }
}

fn check_len(buf: &[u8], count: u64, format: &SampleFormat) -> Result<(), ArchiveError> {
    if buf.len() as u64 != count * format.frame_bytes() as u64 {
        return Err(ArchiveError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "buffer of {} bytes does not hold {} samples of {}",
                buf.len(),
                count,
                format
            ),
        )));
    }
    Ok(())
}

// --- In memory

#[derive(Clone, Debug, PartialEq)]
pub enum ArchiveEvent {
    Open(SegmentSpec),
    Append {
        name: String,
        index: u64,
        count: u64,
        bytes: Vec<u8>,
    },
    Close {
        name: String,
    },
}

/// Records everything it is told. Cloning shares the record.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    log: Rc<RefCell<Vec<ArchiveEvent>>>,
    appends_left: Option<Rc<RefCell<usize>>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// An archive whose appends start failing after `n` successful ones
    pub fn failing_after(n: usize) -> Self {
        Self {
            log: Default::default(),
            appends_left: Some(Rc::new(RefCell::new(n))),
        }
    }

    pub fn events(&self) -> Vec<ArchiveEvent> {
        self.log.borrow().clone()
    }

    /// (index, count) of every append to `name`
    pub fn appends(&self, name: &str) -> Vec<(u64, u64)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ArchiveEvent::Append {
                    name: n,
                    index,
                    count,
                    ..
                } if n == name => Some((*index, *count)),
                _ => None,
            })
            .collect()
    }

    /// Concatenated bytes of every append to `name`
    pub fn bytes(&self, name: &str) -> Vec<u8> {
        self.log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ArchiveEvent::Append { name: n, bytes, .. } if n == name => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn is_closed(&self, name: &str) -> bool {
        let log = self.log.borrow();
        let opened = log
            .iter()
            .rposition(|e| matches!(e, ArchiveEvent::Open(s) if s.name == name));
        let closed = log
            .iter()
            .rposition(|e| matches!(e, ArchiveEvent::Close { name: n } if n == name));
        match (opened, closed) {
            (Some(o), Some(c)) => c > o,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct MemorySegment {
    spec: SegmentSpec,
    log: Rc<RefCell<Vec<ArchiveEvent>>>,
    appends_left: Option<Rc<RefCell<usize>>>,
    guard: IndexGuard,
    open: bool,
}

impl Archive for MemoryArchive {
    type Segment = MemorySegment;

    fn open(&mut self, spec: &SegmentSpec) -> Result<MemorySegment, ArchiveError> {
        self.log.borrow_mut().push(ArchiveEvent::Open(spec.clone()));
        Ok(MemorySegment {
            spec: spec.clone(),
            log: self.log.clone(),
            appends_left: self.appends_left.clone(),
            guard: IndexGuard::default(),
            open: true,
        })
    }
}

impl Segment for MemorySegment {
    fn append(&mut self, index: u64, buf: &[u8], count: u64) -> Result<(), ArchiveError> {
        if !self.open {
            return Err(ArchiveError::NotOpen);
        }
        if let Some(left) = &self.appends_left {
            let mut left = left.borrow_mut();
            if *left == 0 {
                return Err(ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected write failure",
                )));
            }
            *left -= 1;
        }
        check_len(buf, count, &self.spec.format)?;
        self.guard.check(index, count)?;
        self.log.borrow_mut().push(ArchiveEvent::Append {
            name: self.spec.name.clone(),
            index,
            count,
            bytes: buf.to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), ArchiveError> {
        if self.open {
            self.open = false;
            self.log.borrow_mut().push(ArchiveEvent::Close {
                name: self.spec.name.clone(),
            });
        }
        Ok(())
    }
}

// --- On disk

/// Raw samples in time-sharded files:
/// `<root>/<channel>/<UTC subdir start>/rf@<unix s>.<ms>.bin`
#[derive(Clone, Debug)]
pub struct FileArchive {
    root: PathBuf,
    subdir_cadence_s: u64,
    file_cadence_ms: u64,
}

impl FileArchive {
    pub fn new(root: impl Into<PathBuf>, subdir_cadence_s: u64, file_cadence_ms: u64) -> Self {
        Self {
            root: root.into(),
            subdir_cadence_s,
            file_cadence_ms,
        }
    }
}

#[derive(Debug)]
pub struct FileSegment {
    dir: PathBuf,
    spec: SegmentSpec,
    subdir_cadence_s: u64,
    samples_per_file: u64,
    current: Option<(u64, File)>,
    guard: IndexGuard,
    open: bool,
}

impl Archive for FileArchive {
    type Segment = FileSegment;

    fn open(&mut self, spec: &SegmentSpec) -> Result<FileSegment, ArchiveError> {
        let dir = self.root.join(&spec.name);
        fs::create_dir_all(&dir)?;
        let samples_per_file =
            ((spec.sample_rate * self.file_cadence_ms as f64 / 1000.0).round() as u64).max(1);
        let mut props = File::create(dir.join("drf_properties.txt"))?;
        writeln!(props, "sample_rate={}", spec.sample_rate)?;
        writeln!(props, "start_index={}", spec.start_index)?;
        writeln!(props, "format={}", spec.format)?;
        writeln!(props, "subdir_cadence_secs={}", self.subdir_cadence_s)?;
        writeln!(props, "file_cadence_millisecs={}", self.file_cadence_ms)?;
        writeln!(props, "samples_per_file={}", samples_per_file)?;
        writeln!(props, "byte_order=little")?;
        writeln!(props, "identifier={}", spec.identifier)?;
        info!(dir = %dir.display(), start_index = spec.start_index, "Opened archive segment");
        Ok(FileSegment {
            dir,
            spec: spec.clone(),
            subdir_cadence_s: self.subdir_cadence_s,
            samples_per_file,
            current: None,
            guard: IndexGuard::default(),
            open: true,
        })
    }
}

impl FileSegment {
    /// Path of the file holding file-number `n` (absolute index / samples_per_file).
    /// Named after the time of its first sample, which only lands on a cadence
    /// boundary when the rate gives a whole number of samples per file.
    pub fn file_path(&self, n: u64) -> PathBuf {
        let first = n * self.samples_per_file;
        let ms = (first as f64 / self.spec.sample_rate * 1000.0).round() as u64;
        let secs = ms / 1000;
        let subdir = secs - secs % self.subdir_cadence_s;
        let subdir = Utc
            .timestamp_opt(subdir as i64, 0)
            .single()
            .map(|t| t.format("%Y-%m-%dT%H-%M-%S").to_string())
            .unwrap_or_else(|| subdir.to_string());
        self.dir
            .join(subdir)
            .join(format!("rf@{}.{:03}.bin", secs, ms % 1000))
    }

    fn file(&mut self, n: u64) -> Result<&mut File, ArchiveError> {
        if !matches!(self.current, Some((cur, _)) if cur == n) {
            let path = self.file_path(n);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(path = %path.display(), "Opening archive file");
            let file = OpenOptions::new().create(true).write(true).open(&path)?;
            self.current = Some((n, file));
        }
        match &mut self.current {
            Some((_, f)) => Ok(f),
            None => Err(ArchiveError::NotOpen),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Segment for FileSegment {
    fn append(&mut self, index: u64, buf: &[u8], count: u64) -> Result<(), ArchiveError> {
        if !self.open {
            return Err(ArchiveError::NotOpen);
        }
        check_len(buf, count, &self.spec.format)?;
        self.guard.check(index, count)?;
        let frame = self.spec.format.frame_bytes();
        let mut absolute = self.spec.start_index + index;
        let mut rest = buf;
        while !rest.is_empty() {
            let n = absolute / self.samples_per_file;
            let within = absolute - n * self.samples_per_file;
            let take = ((self.samples_per_file - within) as usize).min(rest.len() / frame);
            let (head, tail) = rest.split_at(take * frame);
            let file = self.file(n)?;
            file.seek(SeekFrom::Start(within * frame as u64))?;
            file.write_all(head)?;
            absolute += take as u64;
            rest = tail;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ArchiveError> {
        if self.open {
            self.open = false;
            if let Some((_, file)) = self.current.take() {
                file.sync_all()?;
            }
            info!(dir = %self.dir.display(), "Closed archive segment");
        }
        Ok(())
    }
}
