//! Readable rendering of trace records for `retrace log`.

use retrace_ir::{errno_name, ContentPayload, DirPayload, IrRecord};

/// One line per record, in the shape `cmdN: OP(args)`.
pub fn render(record: &IrRecord) -> String {
    match record {
        IrRecord::SpecialRef { cmd, entity, out } => {
            format!("{}: {} = {:?}", cmd, out, entity)
        }
        IrRecord::PipeRef {
            cmd,
            read_out,
            write_out,
        } => format!("{}: ({}, {}) = PIPE()", cmd, read_out, write_out),
        IrRecord::FileRef { cmd, mode, out } => {
            format!("{}: {} = FILE({:o})", cmd, out, mode)
        }
        IrRecord::SymlinkRef { cmd, target, out } => {
            format!("{}: {} = SYMLINK({:?})", cmd, out, target)
        }
        IrRecord::DirRef { cmd, mode, out } => {
            format!("{}: {} = DIR({:o})", cmd, out, mode)
        }
        IrRecord::PathRef {
            cmd,
            base,
            path,
            flags,
            out,
        } => format!("{}: {} = PATH({}, {:?}, [{}])", cmd, out, base, path, flags),
        IrRecord::ExpectResult {
            cmd,
            ref_id,
            expected,
        } => format!("{}: EXPECT({}, {})", cmd, ref_id, errno_name(*expected)),
        IrRecord::MatchMetadata {
            cmd,
            ref_id,
            expected,
        } => format!(
            "{}: MATCH_METADATA({}, {}:{} {:o})",
            cmd, ref_id, expected.uid, expected.gid, expected.mode
        ),
        IrRecord::MatchContent {
            cmd,
            ref_id,
            expected,
        } => format!(
            "{}: MATCH_CONTENT({}, {})",
            cmd,
            ref_id,
            render_payload(expected)
        ),
        IrRecord::UpdateMetadata {
            cmd,
            ref_id,
            written,
        } => format!(
            "{}: UPDATE_METADATA({}, {}:{} {:o})",
            cmd, ref_id, written.uid, written.gid, written.mode
        ),
        IrRecord::UpdateContent {
            cmd,
            ref_id,
            written,
        } => format!(
            "{}: UPDATE_CONTENT({}, {})",
            cmd,
            ref_id,
            render_payload(written)
        ),
        IrRecord::Launch {
            cmd, child, spec, ..
        } => format!("{}: LAUNCH({}, {:?})", cmd, child, spec.args),
        IrRecord::Join {
            cmd,
            child,
            exit_status,
        } => format!("{}: JOIN({}, {})", cmd, child, exit_status),
        IrRecord::Exit { cmd, exit_status } => format!("{}: EXIT({})", cmd, exit_status),
    }
}

fn render_payload(payload: &ContentPayload) -> String {
    match payload {
        ContentPayload::File(fc) => {
            let digest = fc
                .fingerprint
                .and_then(|fp| fp.hash)
                .map(|h| {
                    h.iter()
                        .take(6)
                        .map(|b| format!("{:02x}", b))
                        .collect::<String>()
                })
                .unwrap_or_else(|| "-".to_string());
            let size = fc.fingerprint.map(|fp| fp.size).unwrap_or(0);
            format!(
                "file[{} {}b{}]",
                digest,
                size,
                if fc.blob.is_some() { " saved" } else { "" }
            )
        }
        ContentPayload::Symlink { target } => format!("symlink[{:?}]", target),
        ContentPayload::Dir(DirPayload::AddEntry { name, target }) => {
            format!("dir[+{} -> {}]", name, target)
        }
        ContentPayload::Dir(DirPayload::RemoveEntry { name }) => format!("dir[-{}]", name),
        ContentPayload::DirListing { entries } => format!("dir[{} entries]", entries.len()),
        ContentPayload::Pipe => "pipe".to_string(),
        ContentPayload::Special { always_changed } => {
            format!("special[{}]", if *always_changed { "volatile" } else { "fixed" })
        }
    }
}
