//! Binary trace log reader and writer, plus the synthesized default trace.
//!
//! Layout: a fixed header (magic, format version, crc32 of both) followed by
//! a sequence of length-prefixed bincode records. The reader treats any
//! defect — missing file, bad magic, version skew, checksum failure,
//! truncation mid-record — as grounds for starting over from the default
//! trace, which forces a full build.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    CommandId, CommandSpec, ContentPayload, IrRecord, IrSink, Metadata, RefId, SpecialRef,
};
use crate::AccessFlags;

const TRACE_MAGIC: [u8; 4] = *b"RTRC";

/// Bumped whenever a record's field tuple changes.
pub const TRACE_FORMAT_VERSION: u32 = 1;

/// Largest record the reader will attempt to decode. Anything bigger is
/// treated as corruption rather than an allocation request.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a trace log (bad magic)")]
    BadMagic,

    #[error("trace format version {found} is not {expected}")]
    BadVersion { found: u32, expected: u32 },

    #[error("trace header checksum mismatch")]
    BadChecksum,

    #[error("trace truncated mid-record")]
    Truncated,

    #[error("record decode failed: {0}")]
    Decode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;

fn header_crc(version: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&TRACE_MAGIC);
    hasher.update(&version.to_le_bytes());
    hasher.finalize()
}

/// Read all records from a saved trace log.
///
/// Callers wanting the fall-back behavior should use
/// [`read_trace_or_default`]; this function surfaces the defect.
pub fn read_trace(path: &Path) -> Result<Vec<IrRecord>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != TRACE_MAGIC {
        return Err(TraceError::BadMagic);
    }

    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != TRACE_FORMAT_VERSION {
        return Err(TraceError::BadVersion {
            found: version,
            expected: TRACE_FORMAT_VERSION,
        });
    }

    reader.read_exact(&mut word)?;
    if u32::from_le_bytes(word) != header_crc(version) {
        return Err(TraceError::BadChecksum);
    }

    let mut records = Vec::new();
    loop {
        match reader.read_exact(&mut word) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(word);
        if len > MAX_RECORD_LEN {
            return Err(TraceError::Truncated);
        }
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|_| TraceError::Truncated)?;
        records.push(bincode::deserialize(&buf)?);
    }

    debug!(path = %path.display(), records = records.len(), "loaded trace");
    Ok(records)
}

/// Read a saved trace, or synthesize the default one when the log is missing
/// or unusable. Returns the records and whether the default was used.
pub fn read_trace_or_default(path: &Path, user_args: &[String]) -> (Vec<IrRecord>, bool) {
    match read_trace(path) {
        Ok(records) if !records.is_empty() => (records, false),
        Ok(_) => {
            warn!(path = %path.display(), "trace log is empty, starting fresh");
            (default_trace(user_args), true)
        }
        Err(TraceError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no saved trace, starting fresh");
            (default_trace(user_args), true)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "trace log unusable, starting fresh");
            (default_trace(user_args), true)
        }
    }
}

/// The trace used when no saved one exists: the build tool references its six
/// special entities and launches the root command over the user's arguments.
pub fn default_trace(user_args: &[String]) -> Vec<IrRecord> {
    let tool = CommandId::BUILD_TOOL;

    let mut args = vec!["retrace-launch".to_string()];
    args.extend(user_args.iter().cloned());
    let spec = CommandSpec::new(args);

    let mut records: Vec<IrRecord> = [
        SpecialRef::Stdin,
        SpecialRef::Stdout,
        SpecialRef::Stderr,
        SpecialRef::Root,
        SpecialRef::Cwd,
        SpecialRef::LaunchExe,
    ]
    .into_iter()
    .map(|entity| IrRecord::SpecialRef {
        cmd: tool,
        entity,
        out: entity.slot(),
    })
    .collect();

    records.push(IrRecord::Launch {
        cmd: tool,
        child: CommandId::ROOT,
        spec,
        refs: vec![
            (RefId::STDIN, RefId::STDIN),
            (RefId::STDOUT, RefId::STDOUT),
            (RefId::STDERR, RefId::STDERR),
            (RefId::ROOT, RefId::ROOT),
            (RefId::CWD, RefId::CWD),
            (RefId::EXE, RefId::EXE),
        ],
    });

    records
}

/// Accumulates the output trace and persists it in one shot.
///
/// Records are buffered in memory so an interrupted build never leaves a
/// half-written log behind; `finish` writes to a temp file and renames it
/// into place.
pub struct TraceWriter {
    path: PathBuf,
    records: Vec<IrRecord>,
}

impl TraceWriter {
    pub fn create(path: PathBuf) -> Self {
        TraceWriter {
            path,
            records: Vec::new(),
        }
    }

    /// Append one record to the pending output.
    pub fn push(&mut self, record: IrRecord) {
        self.records.push(record);
    }

    /// Number of records buffered so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the buffered trace to disk.
    pub fn flush_to_disk(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);

            writer.write_all(&TRACE_MAGIC)?;
            writer.write_all(&TRACE_FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&header_crc(TRACE_FORMAT_VERSION).to_le_bytes())?;

            for record in &self.records {
                let bytes = bincode::serialize(record)?;
                writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
                writer.write_all(&bytes)?;
            }
            writer.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!(path = %self.path.display(), records = self.records.len(), "wrote trace");
        Ok(())
    }
}

impl IrSink for TraceWriter {
    fn special_ref(&mut self, cmd: CommandId, entity: SpecialRef, out: RefId) {
        self.push(IrRecord::SpecialRef { cmd, entity, out });
    }

    fn pipe_ref(&mut self, cmd: CommandId, read_out: RefId, write_out: RefId) {
        self.push(IrRecord::PipeRef {
            cmd,
            read_out,
            write_out,
        });
    }

    fn file_ref(&mut self, cmd: CommandId, mode: u32, out: RefId) {
        self.push(IrRecord::FileRef { cmd, mode, out });
    }

    fn symlink_ref(&mut self, cmd: CommandId, target: PathBuf, out: RefId) {
        self.push(IrRecord::SymlinkRef { cmd, target, out });
    }

    fn dir_ref(&mut self, cmd: CommandId, mode: u32, out: RefId) {
        self.push(IrRecord::DirRef { cmd, mode, out });
    }

    fn path_ref(
        &mut self,
        cmd: CommandId,
        base: RefId,
        path: PathBuf,
        flags: AccessFlags,
        out: RefId,
    ) {
        self.push(IrRecord::PathRef {
            cmd,
            base,
            path,
            flags,
            out,
        });
    }

    fn expect_result(&mut self, cmd: CommandId, ref_id: RefId, expected: i32) {
        self.push(IrRecord::ExpectResult {
            cmd,
            ref_id,
            expected,
        });
    }

    fn match_metadata(&mut self, cmd: CommandId, ref_id: RefId, expected: Metadata) {
        self.push(IrRecord::MatchMetadata {
            cmd,
            ref_id,
            expected,
        });
    }

    fn match_content(&mut self, cmd: CommandId, ref_id: RefId, expected: ContentPayload) {
        self.push(IrRecord::MatchContent {
            cmd,
            ref_id,
            expected,
        });
    }

    fn update_metadata(&mut self, cmd: CommandId, ref_id: RefId, written: Metadata) {
        self.push(IrRecord::UpdateMetadata {
            cmd,
            ref_id,
            written,
        });
    }

    fn update_content(&mut self, cmd: CommandId, ref_id: RefId, written: ContentPayload) {
        self.push(IrRecord::UpdateContent {
            cmd,
            ref_id,
            written,
        });
    }

    fn launch(
        &mut self,
        cmd: CommandId,
        child: CommandId,
        spec: CommandSpec,
        refs: Vec<(RefId, RefId)>,
    ) {
        self.push(IrRecord::Launch {
            cmd,
            child,
            spec,
            refs,
        });
    }

    fn join(&mut self, cmd: CommandId, child: CommandId, exit_status: i32) {
        self.push(IrRecord::Join {
            cmd,
            child,
            exit_status,
        });
    }

    fn exit(&mut self, cmd: CommandId, exit_status: i32) {
        self.push(IrRecord::Exit { cmd, exit_status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_records() -> Vec<IrRecord> {
        vec![
            IrRecord::SpecialRef {
                cmd: CommandId(0),
                entity: SpecialRef::Root,
                out: RefId::ROOT,
            },
            IrRecord::PathRef {
                cmd: CommandId(1),
                base: RefId::ROOT,
                path: PathBuf::from("src/main.c"),
                flags: AccessFlags::read(),
                out: RefId(6),
            },
            IrRecord::ExpectResult {
                cmd: CommandId(1),
                ref_id: RefId(6),
                expected: 0,
            },
            IrRecord::MatchContent {
                cmd: CommandId(1),
                ref_id: RefId(6),
                expected: ContentPayload::File(crate::FileContent::empty()),
            },
            IrRecord::Exit {
                cmd: CommandId(1),
                exit_status: 0,
            },
        ]
    }

    #[test]
    fn test_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("trace.bin");

        let mut writer = TraceWriter::create(path.clone());
        for r in sample_records() {
            writer.push(r);
        }
        writer.flush_to_disk().unwrap();

        let loaded = read_trace(&path).unwrap();
        assert_eq!(loaded, sample_records());
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("a.bin");
        let second = temp.path().join("b.bin");

        let mut writer = TraceWriter::create(first.clone());
        for r in sample_records() {
            writer.push(r);
        }
        writer.flush_to_disk().unwrap();

        let mut rewriter = TraceWriter::create(second.clone());
        for r in read_trace(&first).unwrap() {
            rewriter.push(r);
        }
        rewriter.flush_to_disk().unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_truncated_log_falls_back_to_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("trace.bin");

        let mut writer = TraceWriter::create(path.clone());
        for r in sample_records() {
            writer.push(r);
        }
        writer.flush_to_disk().unwrap();

        // Chop the tail off mid-record
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(read_trace(&path).is_err());
        let (records, fresh) = read_trace_or_default(&path, &[]);
        assert!(fresh);
        assert!(matches!(records.last(), Some(IrRecord::Launch { .. })));
    }

    #[test]
    fn test_garbage_log_falls_back_to_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("trace.bin");
        fs::write(&path, b"definitely not a trace").unwrap();

        let (records, fresh) = read_trace_or_default(&path, &["make".to_string()]);
        assert!(fresh);
        assert_eq!(records.len(), 7);
    }

    #[test]
    fn test_missing_log_falls_back_to_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nope.bin");

        let (records, fresh) = read_trace_or_default(&path, &[]);
        assert!(fresh);
        assert_eq!(records.len(), 7);
    }

    #[test]
    fn test_default_trace_shape() {
        let records = default_trace(&["sh".to_string(), "build.sh".to_string()]);

        // Six special refs, then the launch of the root command
        assert_eq!(records.len(), 7);
        for r in &records[..6] {
            assert!(matches!(r, IrRecord::SpecialRef { cmd, .. } if *cmd == CommandId::BUILD_TOOL));
        }
        match &records[6] {
            IrRecord::Launch {
                cmd, child, spec, refs,
            } => {
                assert_eq!(*cmd, CommandId::BUILD_TOOL);
                assert_eq!(*child, CommandId::ROOT);
                assert_eq!(spec.args, vec!["retrace-launch", "sh", "build.sh"]);
                assert_eq!(refs.len(), 6);
            }
            other => panic!("expected launch record, got {:?}", other),
        }
    }

    #[test]
    fn test_version_skew_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("trace.bin");

        let mut writer = TraceWriter::create(path.clone());
        writer.push(IrRecord::Exit {
            cmd: CommandId(1),
            exit_status: 0,
        });
        writer.flush_to_disk().unwrap();

        // Corrupt the version field; checksum no longer matches either
        let mut bytes = fs::read(&path).unwrap();
        bytes[4] = 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(read_trace(&path).is_err());
    }
}
