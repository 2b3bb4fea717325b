//! `o4 drop --havelist`: drop records the server's have-list already agrees
//! with.
//!
//! One-shot: the whole input is buffered before the have-list is pulled, so
//! the list reflects any syncs earlier stages performed. `p4 have` is
//! consumed in text mode — for a large workspace the marshaled form costs
//! far more than it gives.

use std::io::{BufRead, Write};

use anyhow::{Context as _, Result};
use o4_fstat::record::{Line, decode_line};
use o4_pyforce::p4_text;

use crate::context::Context;

pub fn run(ctx: &Context, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<()> {
    let mut records = Vec::new();
    for line in input.lines() {
        let line = line?;
        match decode_line(&line)? {
            Line::Blank => {}
            Line::Passthrough(raw) => writeln!(out, "{raw}")?,
            Line::Record(record) => records.push(record),
        }
    }
    if records.is_empty() {
        return Ok(());
    }

    // `//depot/dir/file#3 - ...` → `file#3 - ...` for prefix matching.
    let strip = ctx.depot_root().len() + 1;
    let have = p4_text(["have", "..."]).context("p4 have")?;
    let mut haves: Vec<&str> = have
        .lines()
        .filter_map(|line| line.get(strip..))
        .collect();
    haves.sort_unstable();

    for record in records {
        // Deletes have nothing to hold at a revision; they are never
        // forwarded.
        if record.is_delete() {
            continue;
        }
        let needle = format!(
            "{}#{} -",
            o4_pyforce::escape(&record.path),
            record.revision
        );
        let i = haves.partition_point(|h| *h < needle.as_str());
        let held = haves.get(i).is_some_and(|h| h.starts_with(&needle));
        if !held {
            writeln!(out, "{}", record.encode())?;
        }
    }
    Ok(())
}
