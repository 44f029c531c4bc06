//! Kernel log sources.
//!
//! A source hands out only the lines appended since its baseline. It opens
//! lazily, so an unreadable log is a transient [`StressError::MonitorRead`]
//! and the next read tries again.

use crate::config::types::{LogSourceKind, Result, StressError};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub const KMSG_PATH: &str = "/dev/kmsg";

/// Upper bound on bytes consumed from a text log per read
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

pub trait LogSource: Send {
    /// Establish the baseline; earlier content is never returned
    fn start(&mut self) -> Result<()>;

    /// Complete lines appended since the previous read
    fn read_new(&mut self) -> Result<Vec<String>>;

    fn describe(&self) -> String;
}

/// Build the configured source
pub fn open_source(kind: &LogSourceKind) -> Box<dyn LogSource> {
    match kind {
        LogSourceKind::Kmsg => Box::new(KmsgSource::new()),
        LogSourceKind::File { path } => Box::new(FileLogSource::new(path.clone())),
    }
}

fn read_error(path: &Path, e: impl std::fmt::Display) -> StressError {
    StressError::MonitorRead(format!("{}: {}", path.display(), e))
}

/// Plain text log read by byte offset.
///
/// A file that shrinks or is replaced is resynchronised to its current end;
/// a trailing line without a newline is held until it is completed.
#[derive(Debug)]
pub struct FileLogSource {
    path: PathBuf,
    offset: Option<u64>,
    inode: Option<u64>,
    partial: Vec<u8>,
    resets: u64,
}

impl FileLogSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: None,
            inode: None,
            partial: Vec::new(),
            resets: 0,
        }
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Truncations or replacements seen so far
    pub fn resets(&self) -> u64 {
        self.resets
    }

    fn resync(&mut self, len: u64, inode: u64, reason: &str) {
        warn!(
            "{} {}; cursor reset to {}",
            self.path.display(),
            reason,
            len
        );
        self.offset = Some(len);
        self.inode = Some(inode);
        self.partial.clear();
        self.resets += 1;
    }
}

impl LogSource for FileLogSource {
    fn start(&mut self) -> Result<()> {
        self.partial.clear();
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                self.offset = Some(meta.len());
                self.inode = Some(meta.ino());
                debug!("{} baseline at byte {}", self.path.display(), meta.len());
                Ok(())
            }
            // Everything in a log created after start is new
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.offset = Some(0);
                self.inode = None;
                Ok(())
            }
            Err(e) => {
                self.offset = None;
                Err(read_error(&self.path, e))
            }
        }
    }

    fn read_new(&mut self) -> Result<Vec<String>> {
        let mut file = File::open(&self.path).map_err(|e| read_error(&self.path, e))?;
        let meta = file.metadata().map_err(|e| read_error(&self.path, e))?;
        let len = meta.len();

        let offset = match self.offset {
            Some(offset) => offset,
            None => {
                // baseline could not be taken at start
                self.offset = Some(len);
                self.inode = Some(meta.ino());
                return Ok(Vec::new());
            }
        };

        if len < offset {
            self.resync(len, meta.ino(), "shrank");
            return Ok(Vec::new());
        }
        if self.inode.is_some_and(|ino| ino != meta.ino()) {
            self.resync(len, meta.ino(), "was replaced");
            return Ok(Vec::new());
        }
        self.inode = Some(meta.ino());
        if len == offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| read_error(&self.path, e))?;
        let mut chunk = Vec::new();
        let read = file
            .take((len - offset).min(MAX_READ_BYTES))
            .read_to_end(&mut chunk)
            .map_err(|e| read_error(&self.path, e))?;
        self.offset = Some(offset + read as u64);

        self.partial.extend_from_slice(&chunk);
        Ok(take_complete_lines(&mut self.partial))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Split off every newline-terminated line, leaving the remainder in `buf`
fn take_complete_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };
    let rest = buf.split_off(last_newline + 1);
    let complete = std::mem::replace(buf, rest);
    complete
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}

/// One `/dev/kmsg` record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KmsgRecord {
    pub priority: u8,
    pub sequence: u64,
    pub timestamp_us: u64,
    pub message: String,
}

/// Parse `"<prefix>,<seq>,<usec>,<flags>[,...];<message>\n[ KEY=value\n...]"`
pub fn parse_kmsg_record(raw: &[u8]) -> Option<KmsgRecord> {
    let text = String::from_utf8_lossy(raw);
    let (header, body) = text.split_once(';')?;
    let mut fields = header.split(',');
    let prefix: u32 = fields.next()?.trim().parse().ok()?;
    let sequence = fields.next()?.trim().parse().ok()?;
    let timestamp_us = fields.next()?.trim().parse().ok()?;
    let message = body.split('\n').next().unwrap_or_default();
    Some(KmsgRecord {
        priority: (prefix & 7) as u8,
        sequence,
        timestamp_us,
        message: unescape_kmsg(message),
    })
}

/// Undo the `\xNN` escaping applied to non-printable bytes
fn unescape_kmsg(message: &str) -> String {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() && bytes[i + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Reader over the `/dev/kmsg` record interface.
///
/// Opened non-blocking and positioned at the end, so the ring buffer backlog
/// is skipped. `EPIPE` means the reader fell behind and records were
/// overwritten; the next read continues at the oldest available record.
#[derive(Debug)]
pub struct KmsgSource {
    path: PathBuf,
    file: Option<File>,
    last_sequence: Option<u64>,
    lost_records: u64,
}

impl Default for KmsgSource {
    fn default() -> Self {
        Self::new()
    }
}

impl KmsgSource {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(KMSG_PATH),
            file: None,
            last_sequence: None,
            lost_records: 0,
        }
    }

    /// Records overwritten before they could be read
    pub fn lost_records(&self) -> u64 {
        self.lost_records
    }

    fn open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let mut file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
                .map_err(|e| read_error(&self.path, e))?;
            file.seek(SeekFrom::End(0))
                .map_err(|e| read_error(&self.path, e))?;
            debug!("Opened {} at end of ring buffer", self.path.display());
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| read_error(&self.path, "not open"))
    }

    fn note_sequence(&mut self, sequence: u64) {
        if let Some(last) = self.last_sequence {
            if sequence > last + 1 {
                self.lost_records += sequence - last - 1;
            }
        }
        self.last_sequence = Some(sequence);
    }
}

impl LogSource for KmsgSource {
    fn start(&mut self) -> Result<()> {
        self.file = None;
        self.last_sequence = None;
        self.open().map(|_| ())
    }

    fn read_new(&mut self) -> Result<Vec<String>> {
        let path = self.path.clone();
        let mut records = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let file = self.open()?;
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => records.push(buf[..n].to_vec()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                    warn!("{}: ring buffer overran the reader", path.display());
                }
                Err(e) => {
                    self.file = None;
                    return Err(read_error(&path, e));
                }
            }
        }

        let mut lines = Vec::with_capacity(records.len());
        for raw in records {
            match parse_kmsg_record(&raw) {
                Some(record) => {
                    self.note_sequence(record.sequence);
                    lines.push(record.message);
                }
                None => debug!("Unparseable kmsg record: {:?}", String::from_utf8_lossy(&raw)),
            }
        }
        Ok(lines)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn backlog_before_start_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("kern.log");
        append(&log, "old line 1\nold line 2\n");

        let mut source = FileLogSource::new(log.clone());
        source.start().unwrap();
        assert!(source.read_new().unwrap().is_empty());

        append(&log, "new line\n");
        assert_eq!(source.read_new().unwrap(), vec!["new line"]);
        assert!(source.read_new().unwrap().is_empty());
    }

    #[test]
    fn partial_line_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("kern.log");
        let mut source = FileLogSource::new(log.clone());
        source.start().unwrap();

        append(&log, "complete\npart");
        assert_eq!(source.read_new().unwrap(), vec!["complete"]);
        append(&log, "ial\r\n");
        assert_eq!(source.read_new().unwrap(), vec!["partial"]);
    }

    #[test]
    fn shrink_resets_cursor_without_recount() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("kern.log");
        append(&log, "aaaaaaaaaa\nbbbbbbbbbb\n");
        let mut source = FileLogSource::new(log.clone());
        source.start().unwrap();

        std::fs::write(&log, "c\n").unwrap();
        assert!(source.read_new().unwrap().is_empty());
        assert_eq!(source.offset(), Some(2));
        assert_eq!(source.resets(), 1);

        append(&log, "d\n");
        assert_eq!(source.read_new().unwrap(), vec!["d"]);
    }

    #[test]
    fn missing_log_counts_everything_once_created() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("later.log");
        let mut source = FileLogSource::new(log.clone());
        source.start().unwrap();
        assert!(matches!(source.read_new(), Err(StressError::MonitorRead(_))));

        append(&log, "first\n");
        assert_eq!(source.read_new().unwrap(), vec!["first"]);
    }

    #[test]
    fn kmsg_records_parse() {
        let record =
            parse_kmsg_record(b"3,1234,5678901,-;INFO: task a:1 blocked\n SUBSYSTEM=block\n")
                .unwrap();
        assert_eq!(record.priority, 3);
        assert_eq!(record.sequence, 1234);
        assert_eq!(record.timestamp_us, 5678901);
        assert_eq!(record.message, "INFO: task a:1 blocked");

        let escaped = parse_kmsg_record(b"6,1,2,c;tab\\x09here\n").unwrap();
        assert_eq!(escaped.message, "tab\there");
        assert!(parse_kmsg_record(b"garbage").is_none());
    }

    #[test]
    fn kmsg_sequence_gaps_are_counted() {
        let mut source = KmsgSource::new();
        source.note_sequence(10);
        source.note_sequence(11);
        source.note_sequence(15);
        assert_eq!(source.lost_records(), 3);
    }
}
