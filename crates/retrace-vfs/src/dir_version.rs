//! Directory versions.
//!
//! Unlike other artifact types, directory state is a stack of versions, some
//! of them *partial*: a link or unlink version only speaks for its own entry
//! and lookups fall through to older versions. The stack bottoms out at a
//! version that can answer for every name — a lazily-probed view of an
//! on-disk directory, the authoritative contents of a directory created
//! during the build, or a full listing snapshot.

use std::collections::BTreeSet;
use std::path::Path;

use retrace_ir::CommandId;

/// Answer from asking one directory version about one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Yes,
    No,
    /// This version cannot answer; ask an older one.
    Maybe,
}

/// A directory mutation with its target resolved to an artifact, ready to be
/// applied to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirUpdate {
    Add {
        name: String,
        target: crate::ArtifactId,
    },
    Remove {
        name: String,
    },
}

#[derive(Debug, Clone)]
pub enum DirVersionKind {
    /// A single link operation: `name` now resolves to `target`.
    AddEntry {
        name: String,
        target: crate::ArtifactId,
    },
    /// A single unlink operation: `name` no longer resolves.
    RemoveEntry { name: String },
    /// A directory that existed before the build. Entries are probed on the
    /// live filesystem on demand and remembered either way.
    Existing {
        present: BTreeSet<String>,
        absent: BTreeSet<String>,
    },
    /// A directory created during the build; these contents are authoritative.
    Created { entries: BTreeSet<String> },
    /// A full listing snapshot.
    Listed { entries: BTreeSet<String> },
}

#[derive(Debug, Clone)]
pub struct DirVersion {
    pub kind: DirVersionKind,
    pub creator: Option<CommandId>,
    pub committed: bool,
}

impl DirVersion {
    pub fn new(kind: DirVersionKind, creator: Option<CommandId>) -> Self {
        DirVersion {
            kind,
            creator,
            committed: false,
        }
    }

    /// The base version for a directory scanned from disk.
    pub fn existing() -> Self {
        DirVersion {
            kind: DirVersionKind::Existing {
                present: BTreeSet::new(),
                absent: BTreeSet::new(),
            },
            creator: None,
            committed: true,
        }
    }

    /// The base version for a directory created during the build.
    pub fn created(creator: Option<CommandId>) -> Self {
        let mut entries = BTreeSet::new();
        entries.insert(".".to_string());
        entries.insert("..".to_string());
        DirVersion {
            kind: DirVersionKind::Created { entries },
            creator,
            committed: false,
        }
    }

    pub fn type_name(&self) -> String {
        match &self.kind {
            DirVersionKind::AddEntry { name, .. } => format!("+{}", name),
            DirVersionKind::RemoveEntry { name } => format!("-{}", name),
            DirVersionKind::Existing { .. } => "existing".to_string(),
            DirVersionKind::Created { .. } => "created".to_string(),
            DirVersionKind::Listed { .. } => "list".to_string(),
        }
    }

    /// Does this version speak for `name`?
    ///
    /// `disk_path` is where the directory lives on disk, used by `Existing`
    /// versions to probe entries they have not seen yet.
    pub fn has_entry(&mut self, disk_path: Option<&Path>, name: &str) -> Lookup {
        match &mut self.kind {
            DirVersionKind::AddEntry { name: n, .. } => {
                if n == name {
                    Lookup::Yes
                } else {
                    Lookup::Maybe
                }
            }
            DirVersionKind::RemoveEntry { name: n } => {
                if n == name {
                    Lookup::No
                } else {
                    Lookup::Maybe
                }
            }
            DirVersionKind::Existing { present, absent } => {
                if present.contains(name) {
                    return Lookup::Yes;
                }
                if absent.contains(name) {
                    return Lookup::No;
                }
                let exists = disk_path
                    .map(|dir| dir.join(name).symlink_metadata().is_ok())
                    .unwrap_or(false);
                if exists {
                    present.insert(name.to_string());
                    Lookup::Yes
                } else {
                    absent.insert(name.to_string());
                    Lookup::No
                }
            }
            DirVersionKind::Created { entries } | DirVersionKind::Listed { entries } => {
                if entries.contains(name) {
                    Lookup::Yes
                } else {
                    Lookup::No
                }
            }
        }
    }

    /// The artifact this version itself resolves `name` to, where it can.
    pub fn entry_target(&self, name: &str) -> Option<crate::ArtifactId> {
        match &self.kind {
            DirVersionKind::AddEntry { name: n, target } if n == name => Some(*target),
            _ => None,
        }
    }

    /// Structural equivalence on the mutation payload. Resolved artifact
    /// identities are excluded: arena ids are not stable across builds.
    pub fn matches(&self, other: &DirVersion) -> bool {
        match (&self.kind, &other.kind) {
            (
                DirVersionKind::AddEntry { name: a, .. },
                DirVersionKind::AddEntry { name: b, .. },
            ) => a == b,
            (DirVersionKind::RemoveEntry { name: a }, DirVersionKind::RemoveEntry { name: b }) => {
                a == b
            }
            (
                DirVersionKind::Existing {
                    present: pa,
                    absent: aa,
                },
                DirVersionKind::Existing {
                    present: pb,
                    absent: ab,
                },
            ) => pa == pb && aa == ab,
            (DirVersionKind::Created { entries: a }, DirVersionKind::Created { entries: b }) => {
                a == b
            }
            (DirVersionKind::Listed { entries: a }, DirVersionKind::Listed { entries: b }) => {
                a == b
            }
            _ => false,
        }
    }

    /// Link and unlink versions can always be re-applied to a committed
    /// directory; base versions are snapshots of committed state.
    pub fn can_commit(&self) -> bool {
        true
    }
}
