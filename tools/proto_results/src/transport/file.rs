use crate::codec::{encode, Framing};
use crate::errors::ResultsError;
use crate::listener::TestListener;
use crate::logging::append_run_log;
use crate::parser::ResultParser;
use crate::record::TestRecord;
use crate::reporter::{SnapshotKind, SnapshotSink};
use serde_json::json;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Every emission overwrites the same file.
    Single,
    /// Emission `n` goes to `<path><n>`.
    Periodic,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Periodic => "periodic",
        }
    }
}

/// `<prefix><index>`, with the index appended to the file name itself.
pub fn periodic_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(index.to_string());
    PathBuf::from(name)
}

/// Writes to a `.tmp` sibling and renames it into place, so a reader polling
/// for `path` sees either nothing or the complete payload.
fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), ResultsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ResultsError::Io(e.to_string()))?;
    }
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| ResultsError::Io(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| ResultsError::Io(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct FileSnapshotSink {
    path: PathBuf,
    mode: FileMode,
    framing: Framing,
    written: usize,
}

impl FileSnapshotSink {
    pub fn new(path: impl Into<PathBuf>, mode: FileMode, framing: Framing) -> Self {
        Self {
            path: path.into(),
            mode,
            framing,
            written: 0,
        }
    }

    /// Number of snapshots written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    fn target(&self) -> PathBuf {
        match self.mode {
            FileMode::Single => self.path.clone(),
            FileMode::Periodic => periodic_path(&self.path, self.written),
        }
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn on_snapshot(&mut self, root: &TestRecord, kind: SnapshotKind) -> Result<(), ResultsError> {
        let bytes = encode(root, self.framing)?;
        let target = self.target();
        write_replacing(&target, &bytes)?;
        self.written += 1;
        append_run_log(
            "debug",
            "file_sink.snapshot_written",
            json!({
                "path": target.display().to_string(),
                "kind": kind.as_str(),
                "mode": self.mode.as_str(),
                "bytes": bytes.len(),
            }),
        );
        Ok(())
    }
}

/// Replays a single-mode results file into `parser`.
pub fn replay_file<L: TestListener>(
    path: &Path,
    framing: Framing,
    parser: &mut ResultParser<L>,
) -> Result<usize, ResultsError> {
    parser.process_file(path, framing)
}

/// Follows the `<prefix><index>` files of a periodic sink, in index order.
#[derive(Debug, Clone)]
pub struct PeriodicFileReader {
    prefix: PathBuf,
    framing: Framing,
    next_index: usize,
}

impl PeriodicFileReader {
    pub fn new(prefix: impl Into<PathBuf>, framing: Framing) -> Self {
        Self {
            prefix: prefix.into(),
            framing,
            next_index: 0,
        }
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Feeds every file that has appeared since the last poll; returns how
    /// many were consumed. Stops at the first missing index.
    pub fn poll<L: TestListener>(
        &mut self,
        parser: &mut ResultParser<L>,
    ) -> Result<usize, ResultsError> {
        let mut consumed = 0;
        loop {
            let path = periodic_path(&self.prefix, self.next_index);
            if !path.is_file() {
                break;
            }
            parser.process_file(&path, self.framing)?;
            self.next_index += 1;
            consumed += 1;
        }
        if consumed > 0 {
            append_run_log(
                "debug",
                "file_reader.polled",
                json!({
                    "prefix": self.prefix.display().to_string(),
                    "consumed": consumed,
                    "next_index": self.next_index,
                }),
            );
        }
        Ok(consumed)
    }
}
