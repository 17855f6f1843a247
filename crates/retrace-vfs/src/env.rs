//! The build environment: the single source of artifact identity and path
//! resolution.
//!
//! One `Env` models the filesystem for one build pass. Artifacts enter the
//! model either by scanning the real filesystem during resolution (their
//! initial versions are committed by definition) or anonymously when a
//! command mints a pipe, temporary file, directory, or symlink. A (device,
//! inode) map guarantees at most one identity per on-disk object.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use retrace_cas::CasStore;
use retrace_ir::{CommandId, ContentPayload, FileContent, Metadata, Scenario};

use crate::artifact::{Artifact, ArtifactBody, DirEntry, RefKey, WriteState};
use crate::dir_version::{DirUpdate, DirVersion, DirVersionKind, Lookup};
use crate::version::{
    FileVersion, MetadataVersion, PipeVersion, SpecialVersion, SymlinkVersion,
};
use crate::{ArtifactId, BuildObserver, InputType, Resolution, Result, VfsError};

/// Tunables for one environment.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Collapse consecutive same-reference writes into one version.
    pub combine_writes: bool,
    /// Skip the input record when a command reads its own latest write.
    pub ignore_self_reads: bool,
    /// Save output copies so cached versions can be staged without reruns.
    pub enable_cache: bool,
    /// Symlink traversals allowed before a resolution fails with ELOOP.
    pub symlink_budget: u32,
    /// Scratch directory for temporary paths handed to commands.
    pub temp_dir: PathBuf,
}

impl Default for EnvOptions {
    fn default() -> Self {
        EnvOptions {
            combine_writes: true,
            ignore_self_reads: true,
            enable_cache: true,
            symlink_budget: 40,
            temp_dir: PathBuf::from(".retrace/tmp"),
        }
    }
}

pub struct Env {
    artifacts: Vec<Artifact>,
    /// (device, inode) to artifact identity, for objects seen on disk.
    inodes: HashMap<(u64, u64), ArtifactId>,
    root: Option<ArtifactId>,
    stdin: Option<ArtifactId>,
    stdout: Option<ArtifactId>,
    stderr: Option<ArtifactId>,
    cas: CasStore,
    opts: EnvOptions,
    next_temp: u32,
    euid: u32,
    egid: u32,
}

impl Env {
    pub fn new(cas: CasStore, opts: EnvOptions) -> Self {
        Env {
            artifacts: Vec::new(),
            inodes: HashMap::new(),
            root: None,
            stdin: None,
            stdout: None,
            stderr: None,
            cas,
            opts,
            next_temp: 0,
            euid: nix::unistd::geteuid().as_raw(),
            egid: nix::unistd::getegid().as_raw(),
        }
    }

    pub fn cas(&self) -> &CasStore {
        &self.cas
    }

    pub fn options(&self) -> &EnvOptions {
        &self.opts
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        &self.artifacts[id.0 as usize]
    }

    pub fn artifact_mut(&mut self, id: ArtifactId) -> &mut Artifact {
        &mut self.artifacts[id.0 as usize]
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    fn add_artifact(&mut self, name: String, metadata: MetadataVersion, body: ArtifactBody) -> ArtifactId {
        let id = ArtifactId(self.artifacts.len() as u32);
        self.artifacts.push(Artifact::new(id, name, metadata, body));
        id
    }

    /// The current effective path of an artifact: a committed path if it has
    /// one, otherwise a path derived from its first modeled link.
    pub fn current_path(&self, id: ArtifactId) -> Option<PathBuf> {
        let a = self.artifact(id);
        if let Some(p) = a.paths.first() {
            return Some(p.clone());
        }
        let link = a.links.first()?;
        Some(self.current_path(link.dir)?.join(&link.name))
    }

    /************ Artifact discovery and creation ************/

    /// The root directory artifact, created on first use.
    pub fn get_root_dir(&mut self) -> ArtifactId {
        if let Some(root) = self.root {
            return root;
        }
        let root = self
            .get_filesystem_artifact(Path::new("/"))
            .unwrap_or_else(|e| panic!("failed to stat root directory: {}", e));
        self.artifact_mut(root).name = "/".to_string();
        if let ArtifactBody::Dir { parent, .. } = &mut self.artifact_mut(root).body {
            // ".." at the root resolves to the root itself
            *parent = Some(root);
        }
        self.root = Some(root);
        root
    }

    /// The artifact standing in for one of the inherited standard streams.
    pub fn get_std_stream(&mut self, fd: i32) -> ArtifactId {
        let slot = match fd {
            0 => &mut self.stdin,
            1 => &mut self.stdout,
            2 => &mut self.stderr,
            _ => panic!("not a standard stream fd: {}", fd),
        };
        if let Some(id) = *slot {
            return id;
        }
        let name = match fd {
            0 => "stdin",
            1 => "stdout",
            _ => "stderr",
        };
        let mut mv = MetadataVersion::scanned(Metadata {
            uid: self.euid,
            gid: self.egid,
            mode: libc::S_IFIFO | 0o600,
        });
        mv.committed = true;
        let id = self.add_artifact(
            name.to_string(),
            mv,
            ArtifactBody::Pipe {
                content: PipeVersion::new(None),
                write: WriteState::default(),
            },
        );
        match fd {
            0 => self.stdin = Some(id),
            1 => self.stdout = Some(id),
            _ => self.stderr = Some(id),
        }
        id
    }

    /// Model an object found on the real filesystem. The (device, inode) map
    /// makes repeated discoveries of the same object return one identity.
    pub fn get_filesystem_artifact(&mut self, path: &Path) -> std::io::Result<ArtifactId> {
        let st = nix::sys::stat::lstat(path).map_err(std::io::Error::from)?;
        let key = (st.st_dev as u64, st.st_ino as u64);
        if let Some(&id) = self.inodes.get(&key) {
            self.artifact_mut(id).add_path(path.to_path_buf());
            return Ok(id);
        }

        let meta = Metadata {
            uid: st.st_uid,
            gid: st.st_gid,
            mode: st.st_mode as u32,
        };
        let mv = MetadataVersion::scanned(meta);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        let body = match st.st_mode as u32 & libc::S_IFMT {
            libc::S_IFREG => {
                let mtime = st.st_mtime * 1_000_000_000 + st.st_mtime_nsec;
                ArtifactBody::File {
                    content: FileVersion::scanned(st.st_size as u64, mtime),
                    write: WriteState::default(),
                }
            }
            libc::S_IFDIR => ArtifactBody::Dir {
                versions: vec![DirVersion::existing()],
                resolved: HashMap::new(),
                parent: None,
            },
            libc::S_IFLNK => {
                let target = fs::read_link(path)?;
                ArtifactBody::Symlink {
                    content: SymlinkVersion::scanned(target),
                }
            }
            libc::S_IFIFO => ArtifactBody::Pipe {
                content: PipeVersion::new(None),
                write: WriteState::default(),
            },
            other => {
                // Character and block devices, sockets. /dev/null is the one
                // device whose reads are stable.
                let fixed = path == Path::new("/dev/null");
                debug!(path = %path.display(), mode = other, "special filesystem node");
                ArtifactBody::Special {
                    content: SpecialVersion::new(!fixed),
                }
            }
        };

        let id = self.add_artifact(name, mv, body);
        self.artifact_mut(id).add_path(path.to_path_buf());
        self.inodes.insert(key, id);
        Ok(id)
    }

    /// Mint an anonymous pipe.
    pub fn get_pipe(&mut self, obs: &mut dyn BuildObserver, creator: Option<CommandId>) -> ArtifactId {
        let mut mv = MetadataVersion::new(
            Metadata {
                uid: self.euid,
                gid: self.egid,
                mode: libc::S_IFIFO | 0o600,
            },
            creator,
        );
        mv.committed = true;
        let id = self.add_artifact(
            "pipe".to_string(),
            mv,
            ArtifactBody::Pipe {
                content: PipeVersion::new(creator),
                write: WriteState::default(),
            },
        );
        if let Some(c) = creator {
            obs.output(c, id);
        }
        id
    }

    /// Mint an anonymous symlink with the given target.
    pub fn get_symlink(
        &mut self,
        obs: &mut dyn BuildObserver,
        creator: Option<CommandId>,
        target: PathBuf,
        committed: bool,
    ) -> ArtifactId {
        let mut mv = MetadataVersion::new(
            Metadata {
                uid: self.euid,
                gid: self.egid,
                mode: libc::S_IFLNK | 0o777,
            },
            creator,
        );
        mv.committed = committed;
        let mut sv = SymlinkVersion::new(target, creator);
        sv.committed = committed;
        let id = self.add_artifact(
            "symlink".to_string(),
            mv,
            ArtifactBody::Symlink { content: sv },
        );
        if let Some(c) = creator {
            obs.output(c, id);
        }
        id
    }

    /// Mint an anonymous directory.
    pub fn get_dir(
        &mut self,
        obs: &mut dyn BuildObserver,
        creator: Option<CommandId>,
        mode: u32,
        committed: bool,
    ) -> ArtifactId {
        let mut mv = MetadataVersion::new(
            Metadata {
                uid: self.euid,
                gid: self.egid,
                mode: libc::S_IFDIR | (mode & !current_umask() & 0o7777),
            },
            creator,
        );
        mv.committed = committed;
        let mut dv = DirVersion::created(creator);
        dv.committed = committed;
        let id = self.add_artifact(
            "dir".to_string(),
            mv,
            ArtifactBody::Dir {
                versions: vec![dv],
                resolved: HashMap::new(),
                parent: None,
            },
        );
        if let Some(c) = creator {
            obs.output(c, id);
        }
        id
    }

    /// Mint a new regular file on behalf of a command.
    pub fn create_file(
        &mut self,
        obs: &mut dyn BuildObserver,
        creator: Option<CommandId>,
        mode: u32,
        committed: bool,
    ) -> ArtifactId {
        let mut mv = MetadataVersion::new(
            Metadata {
                uid: self.euid,
                gid: self.egid,
                mode: libc::S_IFREG | (mode & !current_umask() & 0o7777),
            },
            creator,
        );
        mv.committed = committed;
        let mut cv = FileVersion::new(FileContent::empty(), creator);
        cv.committed = committed;
        let id = self.add_artifact(
            "file".to_string(),
            mv,
            ArtifactBody::File {
                content: cv,
                write: WriteState::default(),
            },
        );
        if let Some(c) = creator {
            obs.output(c, id);
        }
        id
    }

    /// Allocate a unique path under the per-build scratch directory.
    pub fn get_temp_path(&mut self) -> PathBuf {
        let _ = fs::create_dir_all(&self.opts.temp_dir);
        loop {
            let candidate = self.opts.temp_dir.join(self.next_temp.to_string());
            self.next_temp += 1;
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    /************ Metadata operations ************/

    /// Peek at current metadata without recording a dependency.
    pub fn metadata_snapshot(&self, a: ArtifactId) -> Metadata {
        self.artifact(a).metadata.meta
    }

    /// Read metadata, recording an input unless this is a self-read.
    pub fn get_metadata(
        &mut self,
        obs: &mut dyn BuildObserver,
        key: RefKey,
        a: ArtifactId,
        kind: InputType,
    ) -> Metadata {
        let ignore_self = self.opts.ignore_self_reads;
        let art = self.artifact_mut(a);
        art.record_accessor(key.0);
        let self_read = art.meta_write.read_by(key);
        let creator = art.metadata.creator;
        let meta = art.metadata.meta;
        if !(self_read && ignore_self) {
            obs.input(key.0, a, creator, true, kind);
        }
        meta
    }

    /// Check metadata against an expected version; mismatches go to the
    /// observer, not the caller.
    pub fn match_metadata(
        &mut self,
        obs: &mut dyn BuildObserver,
        key: RefKey,
        scenario: Scenario,
        a: ArtifactId,
        expected: &Metadata,
    ) {
        let observed = self.get_metadata(obs, key, a, InputType::Accessed);
        if !observed.matches(expected) {
            debug!(
                artifact = %a,
                ?scenario,
                "metadata mismatch (expected {:o}, observed {:o})",
                expected.mode,
                observed.mode
            );
            obs.mismatch(key.0, a);
        }
    }

    /// Apply a metadata write. Returns false when the write was combined into
    /// the previous version and no new version exists.
    pub fn update_metadata(
        &mut self,
        obs: &mut dyn BuildObserver,
        key: RefKey,
        a: ArtifactId,
        meta: Metadata,
        committed: bool,
    ) -> bool {
        let combine = self.opts.combine_writes;
        let art = self.artifact_mut(a);
        if combine && art.meta_write.can_combine(key) {
            art.metadata.meta = meta;
            art.metadata.committed = committed;
            return false;
        }
        art.metadata = MetadataVersion::new(meta, Some(key.0));
        art.metadata.committed = committed;
        art.meta_write.wrote(key);
        obs.output(key.0, a);
        true
    }

    /// The last writer of this artifact's metadata, if any.
    pub fn metadata_writer(&self, a: ArtifactId) -> Option<RefKey> {
        self.artifact(a).meta_write.writer
    }

    /************ Content operations ************/

    /// The last writer of this artifact's content, if any.
    pub fn content_writer(&self, a: ArtifactId) -> Option<RefKey> {
        match &self.artifact(a).body {
            ArtifactBody::File { write, .. } | ArtifactBody::Pipe { write, .. } => write.writer,
            _ => None,
        }
    }

    /// Take a digest for a scanned file version that is still hashless, so
    /// content comparisons are by digest rather than size and mtime.
    pub fn ensure_fingerprint(&mut self, a: ArtifactId) {
        let Some(path) = self.current_path(a) else {
            return;
        };
        let cas = self.cas.clone();
        if let ArtifactBody::File { content, .. } = &mut self.artifact_mut(a).body {
            if content.committed && !content.has_digest() {
                if let Err(e) = content.fingerprint(&path, &cas) {
                    warn!(path = %path.display(), error = %e, "could not fingerprint file");
                }
            }
        }
    }

    /// Peek at current content without recording a dependency.
    pub fn content_snapshot(&mut self, a: ArtifactId) -> ContentPayload {
        self.ensure_fingerprint(a);
        match &self.artifact(a).body {
            ArtifactBody::File { content, .. } => ContentPayload::File(content.content),
            ArtifactBody::Symlink { content } => ContentPayload::Symlink {
                target: content.target.clone(),
            },
            ArtifactBody::Dir { .. } => ContentPayload::DirListing {
                entries: self.list_dir_quiet(a),
            },
            ArtifactBody::Pipe { .. } => ContentPayload::Pipe,
            ArtifactBody::Special { content } => ContentPayload::Special {
                always_changed: content.always_changed,
            },
        }
    }

    /// Read content, recording an input unless this is a self-read.
    pub fn get_content(
        &mut self,
        obs: &mut dyn BuildObserver,
        key: RefKey,
        a: ArtifactId,
        kind: InputType,
    ) -> ContentPayload {
        if let ArtifactBody::Dir { .. } = self.artifact(a).body {
            // Reading a directory's content is a listing; dependencies land
            // on every live directory version.
            let entries = self.list_dir(obs, key.0, a);
            return ContentPayload::DirListing { entries };
        }

        self.ensure_fingerprint(a);
        let ignore_self = self.opts.ignore_self_reads;
        let cas = self.cas.clone();
        let art = self.artifact_mut(a);
        art.record_accessor(key.0);

        let (payload, creator, can_commit, self_read) = match &mut art.body {
            ArtifactBody::File { content, write } => (
                ContentPayload::File(content.content),
                content.creator,
                content.can_commit(&cas),
                write.read_by(key),
            ),
            ArtifactBody::Symlink { content } => (
                ContentPayload::Symlink {
                    target: content.target.clone(),
                },
                content.creator,
                true,
                false,
            ),
            ArtifactBody::Pipe { content, write } => (
                ContentPayload::Pipe,
                content.creator,
                false,
                write.read_by(key),
            ),
            ArtifactBody::Special { content } => (
                ContentPayload::Special {
                    always_changed: content.always_changed,
                },
                content.creator,
                false,
                false,
            ),
            ArtifactBody::Dir { .. } => unreachable!(),
        };

        if !(self_read && ignore_self) {
            obs.input(key.0, a, creator, can_commit, kind);
        }
        payload
    }

    /// Check content against an expected version; mismatches go to the
    /// observer.
    pub fn match_content(
        &mut self,
        obs: &mut dyn BuildObserver,
        key: RefKey,
        scenario: Scenario,
        a: ArtifactId,
        expected: &ContentPayload,
    ) {
        let observed = self.get_content(obs, key, a, InputType::Accessed);
        let matched = match (&observed, expected) {
            (ContentPayload::File(obs_fc), ContentPayload::File(exp_fc)) => obs_fc.matches(exp_fc),
            (
                ContentPayload::Symlink { target: obs_t },
                ContentPayload::Symlink { target: exp_t },
            ) => obs_t == exp_t,
            (
                ContentPayload::DirListing { entries: obs_e },
                ContentPayload::DirListing { entries: exp_e },
            ) => obs_e == exp_e,
            (ContentPayload::Pipe, ContentPayload::Pipe) => true,
            (
                ContentPayload::Special {
                    always_changed: obs_ac,
                },
                ContentPayload::Special {
                    always_changed: exp_ac,
                },
            ) => !obs_ac && !exp_ac,
            _ => false,
        };
        if !matched {
            debug!(
                artifact = %a,
                ?scenario,
                expected = expected.type_name(),
                observed = observed.type_name(),
                "content mismatch"
            );
            obs.mismatch(key.0, a);
        }
    }

    /// Apply a content write. Returns false when the write was combined into
    /// the previous version.
    pub fn update_content(
        &mut self,
        obs: &mut dyn BuildObserver,
        key: RefKey,
        a: ArtifactId,
        payload: &ContentPayload,
        committed: bool,
    ) -> bool {
        let combine = self.opts.combine_writes;
        let art = self.artifact_mut(a);
        let artifact_kind = art.type_name();
        match (&mut art.body, payload) {
            (ArtifactBody::File { content, write }, ContentPayload::File(fc)) => {
                if combine && write.can_combine(key) {
                    content.content = *fc;
                    content.creator = Some(key.0);
                    content.committed = committed;
                    return false;
                }
                let mut v = FileVersion::new(*fc, Some(key.0));
                v.committed = committed;
                *content = v;
                write.wrote(key);
            }
            (ArtifactBody::Pipe { content, write }, ContentPayload::Pipe) => {
                *content = PipeVersion::new(Some(key.0));
                write.wrote(key);
            }
            (ArtifactBody::Special { content }, ContentPayload::Special { always_changed }) => {
                *content = SpecialVersion {
                    always_changed: *always_changed,
                    creator: Some(key.0),
                };
            }
            (ArtifactBody::Symlink { .. }, _) => {
                panic!("symlink content is immutable; write through {} is a tracer bug", a)
            }
            (_, other) => panic!(
                "content write of {} through {} does not fit a {} artifact",
                other.type_name(),
                key.0,
                artifact_kind
            ),
        }
        obs.output(key.0, a);
        true
    }

    /************ Directory operations ************/

    /// Apply a link or unlink to a directory's version stack.
    pub fn apply_dir_entry(
        &mut self,
        obs: &mut dyn BuildObserver,
        cmd: CommandId,
        dir: ArtifactId,
        update: DirUpdate,
        committed: bool,
    ) {
        match update {
            DirUpdate::Add { name, target } => {
                let mut v = DirVersion::new(
                    DirVersionKind::AddEntry {
                        name: name.clone(),
                        target,
                    },
                    Some(cmd),
                );
                v.committed = committed;
                if let ArtifactBody::Dir { versions, resolved, .. } =
                    &mut self.artifact_mut(dir).body
                {
                    versions.insert(0, v);
                    resolved.insert(name.clone(), target);
                } else {
                    panic!("link through {} into non-directory {}", cmd, dir);
                }
                self.artifact_mut(target).links.push(DirEntry {
                    dir,
                    name: name.clone(),
                });
                if committed {
                    if let Some(path) = self.current_path(dir) {
                        self.artifact_mut(target).add_path(path.join(&name));
                    }
                }
            }
            DirUpdate::Remove { name } => {
                // Detach the modeled link from whatever is currently there
                if let Some(target) = self.peek_entry(dir, &name) {
                    let dir_path = self.current_path(dir);
                    let t = self.artifact_mut(target);
                    t.links.retain(|l| !(l.dir == dir && l.name == name));
                    if let Some(p) = dir_path {
                        t.remove_path(&p.join(&name));
                    }
                }
                let mut v = DirVersion::new(
                    DirVersionKind::RemoveEntry { name: name.clone() },
                    Some(cmd),
                );
                v.committed = committed;
                if let ArtifactBody::Dir { versions, resolved, .. } =
                    &mut self.artifact_mut(dir).body
                {
                    versions.insert(0, v);
                    resolved.remove(&name);
                } else {
                    panic!("unlink through {} in non-directory {}", cmd, dir);
                }
            }
        }
        obs.output(cmd, dir);
    }

    /// Current resolution of an entry without observations or disk probing.
    fn peek_entry(&self, dir: ArtifactId, name: &str) -> Option<ArtifactId> {
        match &self.artifact(dir).body {
            ArtifactBody::Dir { resolved, .. } => resolved.get(name).copied(),
            _ => None,
        }
    }

    /// Look up one directory entry, walking the version stack newest to
    /// oldest and stopping at the first definite answer.
    pub fn dir_get_entry(
        &mut self,
        obs: &mut dyn BuildObserver,
        cmd: CommandId,
        dir: ArtifactId,
        name: &str,
    ) -> Resolution {
        if name == "." || name.is_empty() {
            return Ok(dir);
        }
        if name == ".." {
            return self.dir_parent(dir);
        }

        let dir_path = self.current_path(dir);
        let (lookup, matched_idx) = {
            let ArtifactBody::Dir { versions, .. } = &mut self.artifact_mut(dir).body else {
                return Err(libc::ENOTDIR);
            };
            let mut found = (Lookup::Maybe, 0);
            for (idx, v) in versions.iter_mut().enumerate() {
                match v.has_entry(dir_path.as_deref(), name) {
                    Lookup::Maybe => continue,
                    definite => {
                        found = (definite, idx);
                        break;
                    }
                }
            }
            found
        };

        if lookup == Lookup::Maybe {
            panic!(
                "directory lookup for {:?} in {} ended without a definite answer",
                name, dir
            );
        }

        // The matching version decided this resolution
        let (creator, can_commit) = {
            let ArtifactBody::Dir { versions, .. } = &self.artifact(dir).body else {
                unreachable!()
            };
            (versions[matched_idx].creator, versions[matched_idx].can_commit())
        };
        obs.input(cmd, dir, creator, can_commit, InputType::PathResolution);

        if lookup == Lookup::No {
            return Err(libc::ENOENT);
        }

        if let Some(cached) = self.peek_entry(dir, name) {
            return Ok(cached);
        }

        // The version may know the target directly (a link made this entry)
        let from_version = {
            let ArtifactBody::Dir { versions, .. } = &self.artifact(dir).body else {
                unreachable!()
            };
            versions[matched_idx].entry_target(name)
        };

        let target = match from_version {
            Some(t) => t,
            None => {
                // Materialize from the real filesystem
                let parent_path = dir_path.unwrap_or_else(|| {
                    panic!("existing entry {:?} in pathless directory {}", name, dir)
                });
                let full = parent_path.join(name);
                let id = self.get_filesystem_artifact(&full).unwrap_or_else(|e| {
                    panic!(
                        "entry {:?} reported present in {} but unreadable: {}",
                        name,
                        parent_path.display(),
                        e
                    )
                });
                if let ArtifactBody::Dir { parent, .. } = &mut self.artifact_mut(id).body {
                    parent.get_or_insert(dir);
                }
                id
            }
        };

        if let ArtifactBody::Dir { resolved, .. } = &mut self.artifact_mut(dir).body {
            resolved.insert(name.to_string(), target);
        }
        Ok(target)
    }

    fn dir_parent(&mut self, dir: ArtifactId) -> Resolution {
        if Some(dir) == self.root {
            return Ok(dir);
        }
        if let ArtifactBody::Dir { parent: Some(p), .. } = &self.artifact(dir).body {
            return Ok(*p);
        }
        let Some(path) = self.current_path(dir) else {
            panic!("\"..\" lookup in detached directory {}", dir);
        };
        let parent_path = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"));
        let id = self
            .get_filesystem_artifact(&parent_path)
            .map_err(|e| e.raw_os_error().unwrap_or(libc::ENOENT))?;
        if let ArtifactBody::Dir { parent, .. } = &mut self.artifact_mut(dir).body {
            *parent = Some(id);
        }
        Ok(id)
    }

    /// A full listing of the directory's current entries, creating an input
    /// dependency on every live directory version.
    pub fn list_dir(
        &mut self,
        obs: &mut dyn BuildObserver,
        cmd: CommandId,
        dir: ArtifactId,
    ) -> BTreeSet<String> {
        let deps: Vec<(Option<CommandId>, bool)> = match &self.artifact(dir).body {
            ArtifactBody::Dir { versions, .. } => versions
                .iter()
                .map(|v| (v.creator, v.can_commit()))
                .collect(),
            _ => panic!("listing of non-directory {}", dir),
        };
        for (creator, can_commit) in deps {
            obs.input(cmd, dir, creator, can_commit, InputType::Inherited);
        }
        self.artifact_mut(dir).record_accessor(cmd);
        self.list_dir_quiet(dir)
    }

    fn list_dir_quiet(&self, dir: ArtifactId) -> BTreeSet<String> {
        let dir_path = self.current_path(dir);
        let ArtifactBody::Dir { versions, .. } = &self.artifact(dir).body else {
            panic!("listing of non-directory {}", dir);
        };

        let mut entries = BTreeSet::new();
        // Oldest first: the base version seeds the set, newer mutations edit it
        for v in versions.iter().rev() {
            match &v.kind {
                DirVersionKind::Existing { present, absent } => {
                    entries.insert(".".to_string());
                    entries.insert("..".to_string());
                    if let Some(path) = &dir_path {
                        if let Ok(rd) = fs::read_dir(path) {
                            for e in rd.flatten() {
                                entries.insert(e.file_name().to_string_lossy().into_owned());
                            }
                        }
                    }
                    for p in present {
                        entries.insert(p.clone());
                    }
                    for a in absent {
                        entries.remove(a);
                    }
                }
                DirVersionKind::Created { entries: base }
                | DirVersionKind::Listed { entries: base } => {
                    entries.extend(base.iter().cloned());
                }
                DirVersionKind::AddEntry { name, .. } => {
                    entries.insert(name.clone());
                }
                DirVersionKind::RemoveEntry { name } => {
                    entries.remove(name);
                }
            }
        }
        entries
    }

    /************ Path resolution ************/

    /// Resolve `path` from `base`, modeling the kernel's walk: one component
    /// at a time, symlinks followed within a budget, `create` materializing a
    /// missing final file.
    pub fn resolve(
        &mut self,
        obs: &mut dyn BuildObserver,
        cmd: CommandId,
        base: ArtifactId,
        path: &Path,
        flags: retrace_ir::AccessFlags,
        committed: bool,
    ) -> Resolution {
        let mut budget = self.opts.symlink_budget;
        let mut at = if path.is_absolute() {
            self.get_root_dir()
        } else {
            base
        };
        let mut queue: VecDeque<String> = path_components(path);

        while let Some(name) = queue.pop_front() {
            let is_last = queue.is_empty();

            if !self.artifact(at).is_dir() {
                return Err(libc::ENOTDIR);
            }
            // Traversal needs execute permission on each directory
            if !self.artifact(at).metadata.grants(self.euid, self.egid, false, false, true) {
                return Err(libc::EACCES);
            }

            match self.dir_get_entry(obs, cmd, at, &name) {
                Ok(target) => {
                    let is_symlink = self.artifact(target).is_symlink();

                    if is_symlink && (!is_last || !flags.nofollow) {
                        if budget == 0 {
                            return Err(libc::ELOOP);
                        }
                        budget -= 1;

                        let link_target = self
                            .artifact(target)
                            .symlink_target()
                            .cloned()
                            .expect("symlink artifact without target");
                        // Reading the link body is an input to the resolution
                        let (creator, can_commit) = match &self.artifact(target).body {
                            ArtifactBody::Symlink { content } => (content.creator, true),
                            _ => unreachable!(),
                        };
                        obs.input(cmd, target, creator, can_commit, InputType::PathResolution);

                        if link_target.is_absolute() {
                            at = self.get_root_dir();
                        }
                        let mut expanded = path_components(&link_target);
                        while let Some(c) = expanded.pop_back() {
                            queue.push_front(c);
                        }
                        continue;
                    }

                    if is_last {
                        return self.finish_resolution(at, target, flags);
                    }
                    at = target;
                }
                Err(libc::ENOENT) if is_last && flags.create => {
                    // Creating requires write permission on the directory
                    if !self.artifact(at).metadata.grants(self.euid, self.egid, false, true, false) {
                        return Err(libc::EACCES);
                    }
                    let file = self.create_file(obs, Some(cmd), flags.mode, committed);
                    self.apply_dir_entry(
                        obs,
                        cmd,
                        at,
                        DirUpdate::Add {
                            name: name.clone(),
                            target: file,
                        },
                        committed,
                    );
                    self.artifact_mut(file).name = name;
                    return Ok(file);
                }
                Err(e) => return Err(e),
            }
        }

        // Empty path: the reference is to the base itself
        self.finish_resolution(at, at, flags)
    }

    fn finish_resolution(
        &mut self,
        _parent: ArtifactId,
        target: ArtifactId,
        flags: retrace_ir::AccessFlags,
    ) -> Resolution {
        let a = self.artifact(target);

        if flags.create && flags.exclusive {
            return Err(libc::EEXIST);
        }
        // An open-style access that lands on a symlink under nofollow is how
        // the kernel reports ELOOP from open(O_NOFOLLOW)
        if a.is_symlink() && flags.nofollow && flags.is_open_style() {
            return Err(libc::ELOOP);
        }
        if flags.directory && !a.is_dir() {
            return Err(libc::ENOTDIR);
        }
        if a.is_dir() && flags.w {
            return Err(libc::EISDIR);
        }
        if !a.metadata.grants(self.euid, self.egid, flags.r, flags.w, flags.x) {
            return Err(libc::EACCES);
        }
        Ok(target)
    }

    /************ Final state ************/

    /// Commit a link of `target` at the given directory entry, updating the
    /// committed-path set.
    pub fn commit_link(&mut self, target: ArtifactId, entry: &DirEntry) -> Result<()> {
        let dir_path = self
            .current_path(entry.dir)
            .expect("link commit into pathless directory");
        let path = dir_path.join(&entry.name);
        let cas = self.cas.clone();

        match &mut self.artifact_mut(target).body {
            ArtifactBody::File { content, .. } => {
                if !content.committed {
                    content.commit(&path, &cas)?;
                }
            }
            ArtifactBody::Symlink { content } => {
                if !content.committed {
                    content.commit(&path)?;
                }
            }
            ArtifactBody::Dir { versions, .. } => {
                fs::create_dir_all(&path).map_err(|e| VfsError::io(&path, e))?;
                for v in versions.iter_mut() {
                    if matches!(v.kind, DirVersionKind::Created { .. }) {
                        v.committed = true;
                    }
                }
            }
            ArtifactBody::Pipe { .. } | ArtifactBody::Special { .. } => {
                // Nothing to place on disk
                return Ok(());
            }
        }
        self.artifact_mut(target).metadata.commit(&path)?;
        self.artifact_mut(target).add_path(path);
        Ok(())
    }

    /// Commit an unlink at the given directory entry.
    pub fn commit_unlink(&mut self, target: Option<ArtifactId>, entry: &DirEntry) -> Result<()> {
        let dir_path = self
            .current_path(entry.dir)
            .expect("unlink commit in pathless directory");
        let path = dir_path.join(&entry.name);
        match fs::symlink_metadata(&path) {
            Ok(m) if m.is_dir() => {
                fs::remove_dir_all(&path).map_err(|e| VfsError::io(&path, e))?;
            }
            Ok(_) => {
                fs::remove_file(&path).map_err(|e| VfsError::io(&path, e))?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VfsError::io(&path, e)),
        }
        if let Some(t) = target {
            self.artifact_mut(t).remove_path(&path);
        }
        Ok(())
    }

    /// Compare every artifact's final modeled state against the live
    /// filesystem, reporting mismatches that are not already committed.
    pub fn check_final_state(&mut self, obs: &mut dyn BuildObserver) {
        let cas = self.cas.clone();
        for idx in 0..self.artifacts.len() {
            let id = ArtifactId(idx as u32);
            let Some(path) = self.current_path(id) else {
                continue;
            };

            match &mut self.artifact_mut(id).body {
                ArtifactBody::File { content, .. } => {
                    if !content.committed {
                        let creator = content.creator;
                        let can_commit = content.can_commit(&cas);
                        match cas.digest(&path) {
                            Ok(fp) => {
                                let ondisk = FileContent {
                                    fingerprint: Some(fp),
                                    blob: None,
                                };
                                if content.matches(&ondisk) {
                                    // Disk already holds this state
                                    content.committed = true;
                                } else {
                                    obs.final_mismatch(id, creator, can_commit);
                                }
                            }
                            Err(_) => obs.final_mismatch(id, creator, can_commit),
                        }
                    }
                }
                ArtifactBody::Symlink { content } => {
                    if !content.committed {
                        let creator = content.creator;
                        match fs::read_link(&path) {
                            Ok(t) if t == content.target => content.committed = true,
                            _ => obs.final_mismatch(id, creator, true),
                        }
                    }
                }
                // Directory mutations surface through their target artifacts;
                // pipes and specials have no final on-disk state
                ArtifactBody::Dir { .. }
                | ArtifactBody::Pipe { .. }
                | ArtifactBody::Special { .. } => {}
            }

            let meta = &mut self.artifact_mut(id).metadata;
            if !meta.committed {
                let creator = meta.creator;
                let matches = nix::sys::stat::lstat(&path)
                    .map(|st| {
                        meta.meta.matches(&Metadata {
                            uid: st.st_uid,
                            gid: st.st_gid,
                            mode: st.st_mode as u32,
                        })
                    })
                    .unwrap_or(false);
                if matches {
                    meta.committed = true;
                } else {
                    obs.final_mismatch(id, creator, true);
                }
            }
        }
    }

    /// Take fingerprints of versions that are missing them and commit every
    /// uncommitted version to disk. Parents are staged before children.
    pub fn apply_final_state(&mut self) -> Result<()> {
        let mut order: Vec<(usize, ArtifactId)> = (0..self.artifacts.len())
            .filter_map(|idx| {
                let id = ArtifactId(idx as u32);
                self.current_path(id)
                    .map(|p| (p.components().count(), id))
            })
            .collect();
        order.sort();

        let cas = self.cas.clone();
        for (_, id) in order {
            let path = self
                .current_path(id)
                .expect("artifact lost its path mid-commit");

            // Unlinks first, so a new object can take over the name
            let removals: Vec<String> = match &self.artifact(id).body {
                ArtifactBody::Dir { versions, .. } => versions
                    .iter()
                    .filter(|v| !v.committed)
                    .filter_map(|v| match &v.kind {
                        DirVersionKind::RemoveEntry { name } => Some(name.clone()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            for name in removals {
                let entry = DirEntry {
                    dir: id,
                    name: name.clone(),
                };
                self.commit_unlink(None, &entry)?;
            }

            match &mut self.artifact_mut(id).body {
                ArtifactBody::File { content, .. } => {
                    if !content.committed {
                        content.commit(&path, &cas)?;
                    }
                    if !content.has_digest() {
                        if let Err(e) = content.fingerprint(&path, &cas) {
                            warn!(path = %path.display(), error = %e, "could not fingerprint output");
                        }
                    }
                }
                ArtifactBody::Symlink { content } => {
                    if !content.committed {
                        content.commit(&path)?;
                    }
                }
                ArtifactBody::Dir { versions, .. } => {
                    if !path.exists() {
                        fs::create_dir_all(&path).map_err(|e| VfsError::io(&path, e))?;
                    }
                    for v in versions.iter_mut() {
                        v.committed = true;
                    }
                }
                ArtifactBody::Pipe { .. } | ArtifactBody::Special { .. } => continue,
            }

            self.artifact_mut(id).add_path(path.clone());
            self.artifact_mut(id).metadata.commit(&path)?;
        }
        Ok(())
    }

    /// Stage every committable uncommitted version to disk, skipping the
    /// rest. Used before launching a command so its inputs are present;
    /// uncommittable versions belong to commands that are themselves about to
    /// rerun.
    pub fn stage_committable(&mut self) {
        let mut order: Vec<(usize, ArtifactId)> = (0..self.artifacts.len())
            .filter_map(|idx| {
                let id = ArtifactId(idx as u32);
                self.current_path(id)
                    .map(|p| (p.components().count(), id))
            })
            .collect();
        order.sort();

        let cas = self.cas.clone();
        for (_, id) in order {
            let Some(path) = self.current_path(id) else {
                continue;
            };
            match &mut self.artifact_mut(id).body {
                ArtifactBody::File { content, .. } => {
                    if !content.committed && content.can_commit(&cas) {
                        if let Err(e) = content.commit(&path, &cas) {
                            warn!(path = %path.display(), error = %e, "could not stage input");
                            continue;
                        }
                    } else if !content.committed {
                        continue;
                    }
                }
                ArtifactBody::Symlink { content } => {
                    if !content.committed {
                        if let Err(e) = content.commit(&path) {
                            warn!(path = %path.display(), error = %e, "could not stage symlink");
                            continue;
                        }
                    }
                }
                ArtifactBody::Dir { .. } => {
                    if !path.exists() {
                        if let Err(e) = fs::create_dir_all(&path) {
                            warn!(path = %path.display(), error = %e, "could not stage directory");
                            continue;
                        }
                    }
                }
                ArtifactBody::Pipe { .. } | ArtifactBody::Special { .. } => continue,
            }
            self.artifact_mut(id).add_path(path);
        }
    }

    /// Save output copies into the store so future builds can stage them
    /// without rerunning their creators.
    pub fn cache_all(&mut self) {
        if !self.opts.enable_cache {
            return;
        }
        let cas = self.cas.clone();
        for idx in 0..self.artifacts.len() {
            let id = ArtifactId(idx as u32);
            let Some(path) = self.current_path(id) else {
                continue;
            };
            if let ArtifactBody::File { content, .. } = &mut self.artifact_mut(id).body {
                if content.creator.is_some() && content.committed && content.content.blob.is_none() {
                    if let Err(e) = content.save(&path, &cas) {
                        warn!(path = %path.display(), error = %e, "could not cache output");
                    }
                    if let Err(e) = content.fingerprint(&path, &cas) {
                        warn!(path = %path.display(), error = %e, "could not fingerprint output");
                    }
                }
            }
        }
    }
}

/// Break a path into lookup components. `.` is dropped; `..` survives so the
/// walk can consult the directory's parent.
fn path_components(path: &Path) -> VecDeque<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
        })
        .collect()
}

fn current_umask() -> u32 {
    // umask can only be read by setting it
    let mask = unsafe { libc::umask(0) };
    unsafe { libc::umask(mask) };
    mask as u32
}
