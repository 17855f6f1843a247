//! The interceptor-facing call surface: traced events must apply to the
//! model, respect write-combining and self-read suppression, and emit exactly
//! the surviving records into the output trace.

use std::collections::HashSet;
use std::fs;

use tempfile::TempDir;

use retrace_build::{Build, HelperInterceptor, RebuildPlan, RunOptions};
use retrace_cas::CasStore;
use retrace_ir::{
    dispatch, AccessFlags, CommandId, ContentPayload, FileContent, IrRecord, SpecialRef,
    TraceWriter,
};
use retrace_vfs::{Env, EnvOptions, NullObserver};

fn file_payload(bytes: &[u8]) -> ContentPayload {
    ContentPayload::File(FileContent {
        fingerprint: Some(retrace_cas::Fingerprint {
            hash: Some(CasStore::compute_digest(bytes)),
            size: bytes.len() as u64,
            mtime: 0,
        }),
        blob: None,
    })
}

#[test]
fn traced_steps_are_combined_and_suppressed() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("input.txt"), b"in").unwrap();

    let cas = CasStore::open(temp.path().join("cas")).unwrap();
    let env = Env::new(
        cas,
        EnvOptions {
            temp_dir: temp.path().join("tmp"),
            ..Default::default()
        },
    );

    let mut writer = TraceWriter::create(temp.path().join("trace.bin"));
    let mut interceptor = HelperInterceptor::new(None);
    let mut observer = NullObserver;
    let mut build = Build::execute(
        env,
        RebuildPlan::new(),
        HashSet::new(),
        &mut observer,
        &mut writer,
        &mut interceptor,
        RunOptions::default(),
    );

    // Prime the build tool's conventional reference slots
    for entity in [
        SpecialRef::Stdin,
        SpecialRef::Stdout,
        SpecialRef::Stderr,
        SpecialRef::Root,
        SpecialRef::Cwd,
        SpecialRef::LaunchExe,
    ] {
        dispatch(
            IrRecord::SpecialRef {
                cmd: CommandId::BUILD_TOOL,
                entity,
                out: entity.slot(),
            },
            &mut build,
        );
    }
    // 6 records so far

    // A traced writer command creates an output file
    let writer_cmd = build.trace_launch(CommandId::BUILD_TOOL, vec!["cc1".to_string()], vec![]);
    // 7
    let out_ref = build.trace_path_ref(
        writer_cmd,
        retrace_ir::RefId::ROOT,
        temp.path().join("out.txt"),
        AccessFlags::from_open(libc::O_WRONLY | libc::O_CREAT, 0o644),
    );
    // 8
    build.trace_expect_result(writer_cmd, out_ref, 0);
    // 9

    // Two consecutive writes through the same reference collapse to one
    build.trace_update_content(writer_cmd, out_ref, Some(file_payload(b"v1")));
    // 10
    build.trace_update_content(writer_cmd, out_ref, Some(file_payload(b"v1 longer")));
    // still 10: combined

    // The writer re-reading its own write records nothing
    build.trace_match_content(writer_cmd, out_ref);
    // still 10

    // A second command reading the output does record a dependency
    let reader_cmd = build.trace_launch(CommandId::BUILD_TOOL, vec!["ld".to_string()], vec![]);
    // 11
    let in_ref = build.trace_path_ref(
        reader_cmd,
        retrace_ir::RefId::ROOT,
        temp.path().join("out.txt"),
        AccessFlags::read(),
    );
    // 12
    build.trace_match_content(reader_cmd, in_ref);
    // 13

    // The foreign read closed the combining window: the next write tags a
    // fresh version and a fresh record
    build.trace_update_content(writer_cmd, out_ref, Some(file_payload(b"v2")));
    // 14

    build.trace_exit(writer_cmd, 0);
    build.trace_join(CommandId::BUILD_TOOL, writer_cmd, 0);
    build.trace_exit(reader_cmd, 0);
    build.trace_join(CommandId::BUILD_TOOL, reader_cmd, 0);
    // 18

    let stats = build.stats();
    assert!(stats.traced_steps > 0);
    drop(build);

    assert_eq!(writer.len(), 18);
}

#[test]
fn traced_reads_resolve_against_the_live_filesystem() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("input.txt"), b"hello").unwrap();

    let cas = CasStore::open(temp.path().join("cas")).unwrap();
    let env = Env::new(
        cas,
        EnvOptions {
            temp_dir: temp.path().join("tmp"),
            ..Default::default()
        },
    );

    let mut writer = TraceWriter::create(temp.path().join("trace.bin"));
    let mut interceptor = HelperInterceptor::new(None);
    let mut observer = NullObserver;
    let mut build = Build::execute(
        env,
        RebuildPlan::new(),
        HashSet::new(),
        &mut observer,
        &mut writer,
        &mut interceptor,
        RunOptions::default(),
    );

    dispatch(
        IrRecord::SpecialRef {
            cmd: CommandId::BUILD_TOOL,
            entity: SpecialRef::Root,
            out: SpecialRef::Root.slot(),
        },
        &mut build,
    );

    let cmd = build.trace_launch(CommandId::BUILD_TOOL, vec!["cat".to_string()], vec![]);
    let ok_ref = build.trace_path_ref(
        cmd,
        retrace_ir::RefId::ROOT,
        temp.path().join("input.txt"),
        AccessFlags::read(),
    );
    build.trace_expect_result(cmd, ok_ref, 0);
    build.trace_match_content(cmd, ok_ref);

    let missing_ref = build.trace_path_ref(
        cmd,
        retrace_ir::RefId::ROOT,
        temp.path().join("missing.txt"),
        AccessFlags::read(),
    );
    build.trace_expect_result(cmd, missing_ref, libc::ENOENT);

    drop(build);
    writer.flush_to_disk().unwrap();

    // The emitted match carries the on-disk fingerprint
    let records = retrace_ir::read_trace(&temp.path().join("trace.bin")).unwrap();
    let matched = records.iter().any(|r| match r {
        IrRecord::MatchContent {
            expected: ContentPayload::File(fc),
            ..
        } => fc.fingerprint.and_then(|fp| fp.hash) == Some(CasStore::compute_digest(b"hello")),
        _ => false,
    });
    assert!(matched, "match record should carry the live fingerprint");
}
