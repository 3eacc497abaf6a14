//! Diagnostic text dumps

use std::{collections::BTreeMap, io::Write};

use super::{Error, PollFlags, Service, State};
use crate::{
    dump::IndentingWriter,
    platform::{Caller, Permission},
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// What a dump should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpArgs {
    /// Checkin window, ending now
    pub duration_ms: i64,
    /// Force a poll and print nothing else
    pub poll: bool,
    /// Produce the compact machine-readable form
    pub checkin: bool,
    /// Include the complete history rather than what was seen since boot
    pub full: bool,
    /// Include the per-owner recorder
    pub include_uid: bool,
    /// Include the per-owner tagged recorder
    pub include_tag: bool,
}

impl Default for DumpArgs {
    fn default() -> Self {
        Self {
            duration_ms: DAY_MS,
            poll: false,
            checkin: false,
            full: false,
            include_uid: false,
            include_tag: false,
        }
    }
}

impl DumpArgs {
    /// Parse dump arguments. Unknown arguments are ignored, as is a
    /// malformed `--duration=`.
    #[must_use]
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Self {
        let mut parsed = Self::default();
        for arg in args.iter().map(AsRef::as_ref) {
            if let Some(duration) = arg.strip_prefix("--duration=") {
                if let Ok(duration) = duration.parse() {
                    parsed.duration_ms = duration;
                }
                continue;
            }
            match arg {
                "--poll" | "poll" => parsed.poll = true,
                "--checkin" => parsed.checkin = true,
                "--full" | "full" => parsed.full = true,
                "--uid" => parsed.include_uid = true,
                "--tag" => parsed.include_tag = true,
                "detail" => {
                    parsed.include_uid = true;
                    parsed.include_tag = true;
                }
                _ => {}
            }
        }
        parsed
    }
}

impl Service {
    /// Write a diagnostic dump selected by `args` to `out`.
    ///
    /// # Errors
    ///
    /// Fails without [`Permission::Dump`], before
    /// [`Service::system_ready`], if history cannot be loaded or if `out`
    /// fails.
    pub fn dump<W: Write>(&self, caller: &Caller, args: &DumpArgs, out: &mut W) -> Result<(), Error> {
        self.require(caller, Permission::Dump)?;
        let mut state = self.lock();
        state.recorders()?;
        if args.poll {
            self.poll_locked(&mut state, PollFlags::ALL | PollFlags::FORCE);
            writeln!(out, "Forced poll")?;
            return Ok(());
        }
        let now = self.now();
        if args.checkin {
            dump_checkin(&mut state, args, now, out)
        } else {
            dump_full(&mut state, args, now, out)
        }
    }
}

fn dump_checkin<W: Write>(
    state: &mut State,
    args: &DumpArgs,
    now: i64,
    out: &mut W,
) -> Result<(), Error> {
    let end = now;
    let start = end.saturating_sub(args.duration_ms);
    writeln!(out, "v1,{},{}", start / 1000, end / 1000)?;
    let recorders = state.recorders()?;
    writeln!(out, "xt")?;
    recorders.xt.dump_checkin(out, start..end, now)?;
    if args.include_uid {
        writeln!(out, "uid")?;
        recorders.uid.dump_checkin(out, start..end, now)?;
    }
    if args.include_tag {
        writeln!(out, "tag")?;
        recorders.uid_tag.dump_checkin(out, start..end, now)?;
    }
    Ok(())
}

fn dump_full<W: Write>(
    state: &mut State,
    args: &DumpArgs,
    now: i64,
    out: &mut W,
) -> Result<(), Error> {
    let mut out = IndentingWriter::new(out);
    for (title, ifaces) in [
        ("Active interfaces:", &state.active_ifaces),
        ("Active UID interfaces:", &state.active_uid_ifaces),
    ] {
        writeln!(out, "{title}")?;
        out.increase_indent();
        let sorted: BTreeMap<_, _> = ifaces.iter().collect();
        for (iface, ident) in sorted {
            writeln!(out, "iface={iface} ident={ident}")?;
        }
        out.decrease_indent();
    }

    let recorders = state.recorders()?;
    let mut sections = vec![("Dev stats:", &mut recorders.dev), ("Xt stats:", &mut recorders.xt)];
    if args.include_uid {
        sections.push(("UID stats:", &mut recorders.uid));
    }
    if args.include_tag {
        sections.push(("UID tag stats:", &mut recorders.uid_tag));
    }
    for (title, recorder) in sections {
        writeln!(out, "{title}")?;
        out.increase_indent();
        recorder.dump(&mut out, args.full, now)?;
        out.decrease_indent();
    }
    Ok(())
}
