//! `o4 fail`: the terminal pipeline sink.
//!
//! Anything that reaches the end of a sync pipeline is a file that did not
//! make it. This stage swallows the stream, prints a categorized summary of
//! leftover records and accumulated passthrough messages, and decides the
//! pipeline's fate: records or error messages fail it; warnings alone mark
//! the sync incomplete but let it pass.

use std::io::BufRead;
use std::path::Path;

use anyhow::{Result, bail};
use o4_fstat::cache;
use o4_fstat::record::{Line, PassKind, decode_line, parse_passthrough};

const MAX_LISTED: usize = 100;

pub fn run(input: &mut dyn BufRead) -> Result<()> {
    let mut files: Vec<String> = Vec::new();
    let mut rejected: u64 = 0;
    let mut infos: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();

    for line in input.lines() {
        let line = line?;
        match decode_line(&line)? {
            Line::Blank => {}
            Line::Passthrough(raw) => {
                if let Some((kind, msg)) = parse_passthrough(&raw) {
                    match kind {
                        PassKind::Info => infos.push(msg.to_owned()),
                        PassKind::Warn => warnings.push(msg.to_owned()),
                        PassKind::Err => errors.push(msg.to_owned()),
                    }
                }
            }
            Line::Record(record) => {
                rejected += 1;
                if files.len() < MAX_LISTED {
                    files.push(format!("  {}#{}", record.path, record.revision));
                }
            }
        }
    }

    if rejected == 0 && infos.is_empty() && warnings.is_empty() && errors.is_empty() {
        return Ok(());
    }

    for (label, messages) in [("INFO", &mut infos), ("WARNING", &mut warnings)] {
        if !messages.is_empty() {
            messages.sort();
            eprintln!("*** {label}:\n\t{}", messages.join("\n\t"));
        }
    }
    if !files.is_empty() {
        files.sort();
        eprintln!("These files did not sync");
        eprintln!("{}", files.join("\n"));
        if rejected as usize != files.len() {
            eprintln!("  ...and {} others!", rejected - files.len() as u64);
        }
    }
    if !errors.is_empty() {
        errors.sort();
        eprintln!("*** ERROR:\n\t{}", errors.join("\n\t"));
    }

    if rejected > 0 || !errors.is_empty() {
        let s = if rejected == 1 { "" } else { "s" };
        bail!("pipeline ended with {rejected} file{s} rejected");
    }
    if !warnings.is_empty() {
        // Warnings only: a soft failure. The sync completes but must not
        // publish its changelist marker.
        cache::set_incomplete(Path::new(".o4"))?;
    }
    Ok(())
}
