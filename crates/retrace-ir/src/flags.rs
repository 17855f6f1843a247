//! Access flags for path references, translated to and from POSIX bit sets.

use serde::{Deserialize, Serialize};

/// The flags attached to a path reference.
///
/// These describe what the referencing command asked of the resolution: the
/// access it needs, whether the final symlink is followed, and whether the
/// reference creates or truncates the object. `mode` carries the permission
/// bits used when `create` materializes a new file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags {
    pub r: bool,
    pub w: bool,
    pub x: bool,
    pub nofollow: bool,
    pub truncate: bool,
    pub create: bool,
    pub exclusive: bool,
    pub directory: bool,
    pub mode: u32,
}

impl AccessFlags {
    /// Read-only resolution, following symlinks.
    pub fn read() -> Self {
        AccessFlags {
            r: true,
            ..Default::default()
        }
    }

    /// Read + execute, the access needed to traverse and list directories.
    pub fn read_exec() -> Self {
        AccessFlags {
            r: true,
            x: true,
            ..Default::default()
        }
    }

    /// Translate from the flags and mode arguments of `open(2)`.
    pub fn from_open(flags: i32, mode: u32) -> Self {
        let accmode = flags & libc::O_ACCMODE;
        AccessFlags {
            r: accmode == libc::O_RDONLY || accmode == libc::O_RDWR,
            w: accmode == libc::O_WRONLY || accmode == libc::O_RDWR,
            x: false,
            nofollow: flags & libc::O_NOFOLLOW != 0,
            truncate: flags & libc::O_TRUNC != 0,
            create: flags & libc::O_CREAT != 0,
            exclusive: flags & libc::O_EXCL != 0,
            directory: flags & libc::O_DIRECTORY != 0,
            mode,
        }
    }

    /// Translate back to `open(2)` flag and mode arguments.
    pub fn to_open(&self) -> (i32, u32) {
        let mut flags = match (self.r, self.w) {
            (_, false) => libc::O_RDONLY,
            (false, true) => libc::O_WRONLY,
            (true, true) => libc::O_RDWR,
        };
        if self.nofollow {
            flags |= libc::O_NOFOLLOW;
        }
        if self.truncate {
            flags |= libc::O_TRUNC;
        }
        if self.create {
            flags |= libc::O_CREAT;
        }
        if self.exclusive {
            flags |= libc::O_EXCL;
        }
        if self.directory {
            flags |= libc::O_DIRECTORY;
        }
        (flags, self.mode)
    }

    /// Translate from the mode and flags arguments of `faccessat(2)`.
    pub fn from_access(mode: i32, flags: i32) -> Self {
        AccessFlags {
            r: mode & libc::R_OK != 0,
            w: mode & libc::W_OK != 0,
            x: mode & libc::X_OK != 0,
            nofollow: flags & libc::AT_SYMLINK_NOFOLLOW != 0,
            ..Default::default()
        }
    }

    /// Translate from the flags argument of `fstatat(2)`.
    pub fn from_stat(flags: i32) -> Self {
        AccessFlags {
            nofollow: flags & libc::AT_SYMLINK_NOFOLLOW != 0,
            ..Default::default()
        }
    }

    /// True when the reference carries open-style intent rather than a pure
    /// stat-style inspection of the object.
    pub fn is_open_style(&self) -> bool {
        self.create || self.truncate || self.w
    }
}

impl std::fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.r { 'r' } else { '-' },
            if self.w { 'w' } else { '-' },
            if self.x { 'x' } else { '-' }
        )?;
        if self.nofollow {
            write!(f, " nofollow")?;
        }
        if self.truncate {
            write!(f, " truncate")?;
        }
        if self.create {
            write!(f, " create")?;
        }
        if self.exclusive {
            write!(f, " exclusive")?;
        }
        if self.directory {
            write!(f, " directory")?;
        }
        Ok(())
    }
}
