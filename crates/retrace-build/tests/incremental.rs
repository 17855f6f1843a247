//! Incremental-build behavior over hand-built traces.
//!
//! These tests model the interesting build shapes — a script launching
//! compile steps, cached intermediates, directory listings — as record
//! streams, then check what the planner decides and what the execute pass
//! leaves on disk.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use retrace_build::{plan_build, run_build, BuildRequest, Reason};
use retrace_cas::CasStore;
use retrace_ir::{
    AccessFlags, CommandId, CommandSpec, ContentPayload, FileContent, IrRecord, RefId, SpecialRef,
    TraceWriter,
};

const TOOL: CommandId = CommandId::BUILD_TOOL;
const ROOT: CommandId = CommandId::ROOT;

fn special_refs() -> Vec<IrRecord> {
    [
        SpecialRef::Stdin,
        SpecialRef::Stdout,
        SpecialRef::Stderr,
        SpecialRef::Root,
        SpecialRef::Cwd,
        SpecialRef::LaunchExe,
    ]
    .into_iter()
    .map(|entity| IrRecord::SpecialRef {
        cmd: TOOL,
        entity,
        out: entity.slot(),
    })
    .collect()
}

fn standard_refs() -> Vec<(RefId, RefId)> {
    vec![
        (RefId::STDIN, RefId::STDIN),
        (RefId::STDOUT, RefId::STDOUT),
        (RefId::STDERR, RefId::STDERR),
        (RefId::ROOT, RefId::ROOT),
        (RefId::CWD, RefId::CWD),
        (RefId::EXE, RefId::EXE),
    ]
}

fn launch(parent: CommandId, child: CommandId, argv: &[&str]) -> IrRecord {
    IrRecord::Launch {
        cmd: parent,
        child,
        spec: CommandSpec::new(argv.iter().map(|s| s.to_string()).collect()),
        refs: standard_refs(),
    }
}

fn read_file(cmd: CommandId, path: &Path, slot: u16, cas: &CasStore) -> Vec<IrRecord> {
    let fp = cas.digest(path).expect("fingerprint source file");
    vec![
        IrRecord::PathRef {
            cmd,
            base: RefId::ROOT,
            path: path.to_path_buf(),
            flags: AccessFlags::read(),
            out: RefId(slot),
        },
        IrRecord::ExpectResult {
            cmd,
            ref_id: RefId(slot),
            expected: 0,
        },
        IrRecord::MatchContent {
            cmd,
            ref_id: RefId(slot),
            expected: ContentPayload::File(FileContent {
                fingerprint: Some(fp),
                blob: None,
            }),
        },
    ]
}

fn write_file(cmd: CommandId, path: &Path, slot: u16, content: FileContent) -> Vec<IrRecord> {
    vec![
        IrRecord::PathRef {
            cmd,
            base: RefId::ROOT,
            path: path.to_path_buf(),
            flags: AccessFlags::from_open(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644),
            out: RefId(slot),
        },
        IrRecord::ExpectResult {
            cmd,
            ref_id: RefId(slot),
            expected: 0,
        },
        IrRecord::UpdateContent {
            cmd,
            ref_id: RefId(slot),
            written: ContentPayload::File(content),
        },
    ]
}

fn finish_cmd(parent: CommandId, cmd: CommandId, status: i32) -> Vec<IrRecord> {
    vec![
        IrRecord::Exit {
            cmd,
            exit_status: status,
        },
        IrRecord::Join {
            cmd: parent,
            child: cmd,
            exit_status: status,
        },
    ]
}

struct Fixture {
    _temp: TempDir,
    pub dir: PathBuf,
    pub req: BuildRequest,
    pub cas: CasStore,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();
        let req = BuildRequest::new(dir.join(".retrace"), vec!["make".to_string()]);
        let cas = CasStore::open(req.state_dir.join("cas")).unwrap();
        Fixture {
            _temp: temp,
            dir,
            req,
            cas,
        }
    }

    fn save_trace(&self, records: Vec<IrRecord>) {
        let mut writer = TraceWriter::create(self.req.trace_path());
        for r in records {
            writer.push(r);
        }
        writer.flush_to_disk().unwrap();
    }
}

/// A build whose sources are untouched replans nothing.
#[test]
fn unchanged_build_is_idempotent() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    fs::write(&src, b"int main() { return 0; }\n").unwrap();

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.extend(read_file(ROOT, &src, 6, &fx.cas));
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    let summary = plan_build(&fx.req).unwrap();
    assert!(!summary.fresh);
    assert!(
        summary.plan.is_empty(),
        "nothing changed but plan was {:?}",
        summary.plan
    );
}

/// Editing a source marks exactly its readers, not the whole tree.
#[test]
fn edit_marks_only_the_reader() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    let other = fx.dir.join("notes.txt");
    fs::write(&src, b"int main() { return 0; }\n").unwrap();
    fs::write(&other, b"unrelated\n").unwrap();

    let compiler = CommandId(2);
    let reader = CommandId(3);

    // The script launches a compiler that reads hello.c, and a second child
    // that reads notes.txt
    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.push(launch(ROOT, compiler, &["cc1", "hello.c"]));
    records.extend(read_file(compiler, &src, 6, &fx.cas));
    records.extend(finish_cmd(ROOT, compiler, 0));
    records.push(launch(ROOT, reader, &["cat", "notes.txt"]));
    records.extend(read_file(reader, &other, 6, &fx.cas));
    records.extend(finish_cmd(ROOT, reader, 0));
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    // Untouched: empty plan
    assert!(plan_build(&fx.req).unwrap().plan.is_empty());

    // Touch the compiler's input only
    fs::write(&src, b"int main() { return 1; }\n").unwrap();
    let summary = plan_build(&fx.req).unwrap();
    assert_eq!(summary.plan.reason(compiler), Some(Reason::Changed));
    assert!(!summary.plan.must_run(ROOT), "script inputs did not change");
    assert!(!summary.plan.must_run(reader), "reader of notes.txt untouched");
}

/// A two-step chain: editing the source reruns the compiler, and the linker
/// downstream of its output.
#[test]
fn chain_propagates_through_intermediates() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    let obj = fx.dir.join("hello.o");
    fs::write(&src, b"v1").unwrap();

    let obj_content = FileContent {
        fingerprint: Some(retrace_cas::Fingerprint {
            hash: Some(CasStore::compute_digest(b"obj-v1")),
            size: 6,
            mtime: 10,
        }),
        blob: Some(fx.cas.store(b"obj-v1").unwrap()),
    };

    let compiler = CommandId(2);
    let linker = CommandId(3);

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.push(launch(ROOT, compiler, &["cc", "-c", "hello.c"]));
    records.extend(read_file(compiler, &src, 6, &fx.cas));
    records.extend(write_file(compiler, &obj, 7, obj_content));
    records.extend(finish_cmd(ROOT, compiler, 0));
    records.push(launch(ROOT, linker, &["cc", "-o", "hello", "hello.o"]));
    // The linker reads the object version the compiler just wrote
    records.push(IrRecord::PathRef {
        cmd: linker,
        base: RefId::ROOT,
        path: obj.clone(),
        flags: AccessFlags::read(),
        out: RefId(6),
    });
    records.push(IrRecord::ExpectResult {
        cmd: linker,
        ref_id: RefId(6),
        expected: 0,
    });
    records.push(IrRecord::MatchContent {
        cmd: linker,
        ref_id: RefId(6),
        expected: ContentPayload::File(FileContent {
            fingerprint: Some(retrace_cas::Fingerprint {
                hash: Some(CasStore::compute_digest(b"obj-v1")),
                size: 6,
                mtime: 10,
            }),
            blob: None,
        }),
    });
    records.extend(finish_cmd(ROOT, linker, 0));
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    fs::write(&src, b"v2").unwrap();
    let summary = plan_build(&fx.req).unwrap();
    assert_eq!(summary.plan.reason(compiler), Some(Reason::Changed));
    assert_eq!(summary.plan.reason(linker), Some(Reason::InputMayChange));
    assert!(!summary.plan.must_run(ROOT));
}

/// A command that listed a directory is marked when a sibling file appears.
#[test]
fn new_sibling_marks_directory_lister() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    fs::write(&src, b"x").unwrap();

    // Snapshot the listing as the script saw it
    let mut entries: BTreeSet<String> = fs::read_dir(&fx.dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.insert(".".to_string());
    entries.insert("..".to_string());

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.push(IrRecord::PathRef {
        cmd: ROOT,
        base: RefId::ROOT,
        path: fx.dir.clone(),
        flags: AccessFlags::read_exec(),
        out: RefId(6),
    });
    records.push(IrRecord::ExpectResult {
        cmd: ROOT,
        ref_id: RefId(6),
        expected: 0,
    });
    records.push(IrRecord::MatchContent {
        cmd: ROOT,
        ref_id: RefId(6),
        expected: ContentPayload::DirListing { entries },
    });
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    assert!(plan_build(&fx.req).unwrap().plan.is_empty());

    // A new sibling changes the listing
    fs::write(fx.dir.join("foo"), b"").unwrap();
    let summary = plan_build(&fx.req).unwrap();
    assert_eq!(summary.plan.reason(ROOT), Some(Reason::Changed));
}

/// A missing output with a cached copy is staged back without a rerun.
#[test]
fn cached_output_is_staged_without_rerun() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    let out = fx.dir.join("hello.o");
    fs::write(&src, b"source").unwrap();

    let blob = fx.cas.store(b"object code").unwrap();
    let content = FileContent {
        fingerprint: Some(retrace_cas::Fingerprint {
            hash: Some(blob),
            size: 11,
            mtime: 5,
        }),
        blob: Some(blob),
    };

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.extend(read_file(ROOT, &src, 6, &fx.cas));
    records.extend(write_file(ROOT, &out, 7, content));
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    // The output was never on disk, but the cache can reproduce it
    let summary = run_build(&fx.req).unwrap();
    assert!(
        summary.plan.is_empty(),
        "cached output should not force a rerun: {:?}",
        summary.plan
    );
    assert_eq!(fs::read(&out).unwrap(), b"object code");

    // And the build stays quiet afterwards
    let summary = run_build(&fx.req).unwrap();
    assert!(summary.plan.is_empty());
    assert_eq!(fs::read(&out).unwrap(), b"object code");
}

/// A stale output with no cached copy forces its creator to rerun.
#[test]
fn uncached_missing_output_needs_its_creator() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    let out = fx.dir.join("hello.o");
    fs::write(&src, b"source").unwrap();

    // Content known only by fingerprint, never saved
    let content = FileContent {
        fingerprint: Some(retrace_cas::Fingerprint {
            hash: Some(CasStore::compute_digest(b"object code")),
            size: 11,
            mtime: 5,
        }),
        blob: None,
    };

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.extend(read_file(ROOT, &src, 6, &fx.cas));
    records.extend(write_file(ROOT, &out, 7, content));
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    let summary = plan_build(&fx.req).unwrap();
    assert_eq!(summary.plan.reason(ROOT), Some(Reason::OutputNeeded));
}

/// A child whose recorded run vanished from the trace marks its parent
/// through the join comparison.
#[test]
fn join_without_child_exit_marks_parent() {
    let fx = Fixture::new();
    let child = CommandId(2);

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.push(launch(ROOT, child, &["cc1"]));
    // No records from the child at all, but the parent recorded a join
    records.push(IrRecord::Join {
        cmd: ROOT,
        child,
        exit_status: 0,
    });
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    let summary = plan_build(&fx.req).unwrap();
    // The child never ran, and the parent saw its status change
    assert!(summary.plan.must_run(child));
    assert!(summary.plan.must_run(ROOT));
}

/// Resolution results are compared as data: a recorded ELOOP stays quiet as
/// long as the symlink stays put.
#[test]
fn recorded_errno_is_stable() {
    let fx = Fixture::new();
    std::os::unix::fs::symlink("nonexistent/target", fx.dir.join("a_symlink")).unwrap();

    let flags = AccessFlags::from_open(libc::O_WRONLY | libc::O_CREAT | libc::O_NOFOLLOW, 0o644);
    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.push(IrRecord::PathRef {
        cmd: ROOT,
        base: RefId::ROOT,
        path: fx.dir.join("a_symlink"),
        flags,
        out: RefId(6),
    });
    records.push(IrRecord::ExpectResult {
        cmd: ROOT,
        ref_id: RefId(6),
        expected: libc::ELOOP,
    });
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records);

    // Identical state: nothing reruns
    assert!(plan_build(&fx.req).unwrap().plan.is_empty());

    // Replace the symlink with a real file: the reference now succeeds, so
    // the recorded ELOOP no longer holds
    fs::remove_file(fx.dir.join("a_symlink")).unwrap();
    fs::write(fx.dir.join("a_symlink"), b"now a file").unwrap();
    let summary = plan_build(&fx.req).unwrap();
    assert_eq!(summary.plan.reason(ROOT), Some(Reason::Changed));
}

/// The second pass rewrites an equivalent trace for an all-emulated build.
#[test]
fn quiet_rebuild_preserves_the_trace() {
    let fx = Fixture::new();
    let src = fx.dir.join("hello.c");
    fs::write(&src, b"stable").unwrap();

    let mut records = special_refs();
    records.push(launch(TOOL, ROOT, &["retrace-launch", "make"]));
    records.extend(read_file(ROOT, &src, 6, &fx.cas));
    records.extend(finish_cmd(TOOL, ROOT, 0));
    fx.save_trace(records.clone());

    let summary = run_build(&fx.req).unwrap();
    assert!(summary.plan.is_empty());

    let rewritten = retrace_ir::read_trace(&fx.req.trace_path()).unwrap();
    assert_eq!(rewritten, records);
}
