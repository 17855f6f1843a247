//! Serializable version payloads carried inside trace records.
//!
//! These are the data halves of the version model: what a command expected to
//! observe (match records) or produced (update records). The runtime halves —
//! creator command, committed state — live in the filesystem model and are
//! never serialized.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use retrace_cas::{Digest, Fingerprint};

use crate::RefId;

/// Metadata for a filesystem object: the triple that `chmod`/`chown` govern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl Metadata {
    /// True when the other metadata would satisfy a match predicate.
    pub fn matches(&self, other: &Metadata) -> bool {
        self == other
    }

    /// The file type bits of the mode.
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }
}

/// The recorded content of a regular file.
///
/// At least one of the fingerprint or the saved-blob handle must be present
/// for the version to be reproducible on disk without rerunning its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileContent {
    pub fingerprint: Option<Fingerprint>,
    pub blob: Option<Digest>,
}

impl FileContent {
    /// Content of a freshly created, empty file.
    pub fn empty() -> Self {
        FileContent {
            fingerprint: Some(Fingerprint::empty()),
            blob: None,
        }
    }

    /// True when this records a known-empty file.
    pub fn is_empty_file(&self) -> bool {
        matches!(self.fingerprint, Some(fp) if fp.size == 0 && fp.hash.is_some())
    }

    /// Compare two recorded contents.
    ///
    /// Strongest first: digests, then identical saved blobs, then the weakest
    /// stat-level key of size and mtime.
    pub fn matches(&self, other: &FileContent) -> bool {
        if let (Some(a), Some(b)) = (self.fingerprint, other.fingerprint) {
            if let (Some(ha), Some(hb)) = (a.hash, b.hash) {
                return ha == hb;
            }
        }
        if let (Some(a), Some(b)) = (self.blob, other.blob) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.fingerprint, other.fingerprint) {
            return a.size == b.size && a.mtime == b.mtime;
        }
        false
    }
}

/// A single directory mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirPayload {
    /// Link `name` to the artifact held by the writing command's `target` ref.
    AddEntry { name: String, target: RefId },
    /// Remove `name` from the directory.
    RemoveEntry { name: String },
}

impl DirPayload {
    pub fn name(&self) -> &str {
        match self {
            DirPayload::AddEntry { name, .. } => name,
            DirPayload::RemoveEntry { name } => name,
        }
    }
}

/// Content payload for any artifact type, as carried by match and update
/// records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentPayload {
    File(FileContent),
    Symlink { target: PathBuf },
    /// A directory mutation (update records only).
    Dir(DirPayload),
    /// A full directory listing snapshot (match records only).
    DirListing { entries: BTreeSet<String> },
    Pipe,
    Special { always_changed: bool },
}

impl ContentPayload {
    /// Stable tag for debugging and trace dumps.
    pub fn type_name(&self) -> &'static str {
        match self {
            ContentPayload::File(_) => "file",
            ContentPayload::Symlink { .. } => "symlink",
            ContentPayload::Dir(DirPayload::AddEntry { .. }) => "dir+entry",
            ContentPayload::Dir(DirPayload::RemoveEntry { .. }) => "dir-entry",
            ContentPayload::DirListing { .. } => "dir-list",
            ContentPayload::Pipe => "pipe",
            ContentPayload::Special { .. } => "special",
        }
    }
}
