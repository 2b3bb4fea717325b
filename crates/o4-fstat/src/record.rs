//! The fstat record codec.
//!
//! One record per line, five comma-separated columns:
//!
//! ```text
//! <changelist>,<escaped-path>,<revision|USECL>,<size>[/utf8|/utf16|/symlink],<MD5|empty>
//! ```
//!
//! Commas and semicolons in the path are escaped as `;.` and `;;`. An empty
//! checksum marks a delete. Blank lines and `#` comments carry no record;
//! `#o4pass-<kind>#<msg>` lines are out-of-band pipeline messages that every
//! stage forwards verbatim.
//!
//! A legacy seven-column form (`CL,REV,SIZE,ACTION,TYPE,CHECKSUM,PATH`, path
//! last and unescaped) is accepted on read and re-emitted as five columns.

use std::fmt;

use o4_pyforce::{Flavor, SizeSpec};

use crate::error::FstatError;

/// The banner written at the top of every cache file.
pub const COLUMNS_BANNER: &str =
    "# COLUMNS: F_CHANGELIST, F_PATH, F_REVISION, F_FILE_SIZE, F_CHECKSUM";

/// A file revision selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Revision {
    Number(u32),
    /// Sentinel: select by the record's changelist (`<path>@<cl>`) instead of
    /// by revision number. Produced only for dummy entries added to carry
    /// unsubmitted renames.
    UseCl,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::UseCl => write!(f, "USECL"),
        }
    }
}

/// One file's metadata at a changelist — the currency of every pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FstatRecord {
    /// The newest change ≤ the sync target that touches this file.
    pub changelist: u64,
    /// Path relative to the depot root, unescaped.
    pub path: String,
    pub revision: Revision,
    pub size: SizeSpec,
    /// Uppercase MD5 hex; empty means the file should not exist.
    pub checksum: String,
}

impl FstatRecord {
    /// A synthetic delete record for `path` at `changelist`.
    pub fn delete(changelist: u64, path: impl Into<String>) -> Self {
        Self {
            changelist,
            path: path.into(),
            revision: Revision::Number(0),
            size: SizeSpec::default(),
            checksum: String::new(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.checksum.is_empty()
    }

    pub fn is_symlink(&self) -> bool {
        self.size.flavor == Flavor::Symlink
    }

    /// Serialize to the five-column wire form (no trailing newline).
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.changelist,
            escape_path(&self.path),
            self.revision,
            self.size,
            self.checksum
        )
    }
}

/// Sort records newest first: descending `(changelist, path)`.
pub fn sort_newest_first(records: &mut [FstatRecord]) {
    records.sort_by(|a, b| {
        (b.changelist, b.path.as_str()).cmp(&(a.changelist, a.path.as_str()))
    });
}

/// A decoded pipeline line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    /// Blank line or `#` comment; carries nothing.
    Blank,
    /// An `#o4pass-…` control line, kept verbatim for re-emission.
    Passthrough(String),
    Record(FstatRecord),
}

/// Severity of a passthrough control line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Info,
    Warn,
    Err,
}

impl PassKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Err => "err",
        }
    }
}

/// Format an out-of-band control line, e.g. `#o4pass-warn#<msg>`.
pub fn passthrough(kind: PassKind, msg: &str) -> String {
    format!("#o4pass-{}#{}", kind.tag(), msg)
}

/// Split a passthrough line into kind and message. Unknown kinds are `None`
/// (the line is still forwarded verbatim by stages).
pub fn parse_passthrough(line: &str) -> Option<(PassKind, &str)> {
    let rest = line.strip_prefix("#o4pass-")?;
    let (kind, msg) = rest.split_once('#')?;
    let kind = match kind {
        "info" => PassKind::Info,
        "warn" => PassKind::Warn,
        "err" => PassKind::Err,
        _ => return None,
    };
    Some((kind, msg))
}

/// Decode one pipeline line (without its trailing newline).
pub fn decode_line(line: &str) -> Result<Line, FstatError> {
    if line.is_empty() {
        return Ok(Line::Blank);
    }
    if line.starts_with("#o4pass") {
        return Ok(Line::Passthrough(line.to_owned()));
    }
    if line.starts_with('#') {
        return Ok(Line::Blank);
    }

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() == 5 {
        return decode_five(line, &fields).map(Line::Record);
    }
    if fields.len() >= 7 {
        // Legacy form: the path is the final column and may itself contain
        // commas, so resplit with a bounded field count.
        let fields: Vec<&str> = line.splitn(7, ',').collect();
        return decode_legacy(line, &fields).map(Line::Record);
    }
    Err(FstatError::Malformed {
        line: line.to_owned(),
    })
}

fn malformed(line: &str) -> FstatError {
    FstatError::Malformed {
        line: line.to_owned(),
    }
}

fn decode_five(line: &str, fields: &[&str]) -> Result<FstatRecord, FstatError> {
    let changelist = fields[0].parse().map_err(|_| malformed(line))?;
    let revision = decode_revision(fields[2]).ok_or_else(|| malformed(line))?;
    let size: SizeSpec = fields[3].parse().map_err(|_| malformed(line))?;
    Ok(FstatRecord {
        changelist,
        path: unescape_path(fields[1]),
        revision,
        size,
        checksum: fields[4].to_owned(),
    })
}

fn decode_legacy(line: &str, fields: &[&str]) -> Result<FstatRecord, FstatError> {
    let changelist = fields[0].parse().map_err(|_| malformed(line))?;
    let revision = decode_revision(fields[1]).ok_or_else(|| malformed(line))?;
    let bytes: u64 = fields[2].parse().map_err(|_| malformed(line))?;
    let action = fields[3];
    let file_type = fields[4];

    let flavor = if file_type.contains("utf16") {
        Flavor::Utf16
    } else if file_type.contains("utf8") {
        Flavor::Utf8
    } else if file_type.contains("symlink") {
        Flavor::Symlink
    } else {
        Flavor::Plain
    };

    let deleted = action.ends_with("delete");
    let size = if deleted {
        // A delete carries no content; only the symlink marker survives.
        let flavor = if flavor == Flavor::Symlink {
            Flavor::Symlink
        } else {
            Flavor::Plain
        };
        SizeSpec::new(0, flavor)
    } else {
        SizeSpec::new(bytes, flavor)
    };
    Ok(FstatRecord {
        changelist,
        path: fields[6].to_owned(),
        revision,
        size,
        checksum: if deleted {
            String::new()
        } else {
            fields[5].to_owned()
        },
    })
}

fn decode_revision(s: &str) -> Option<Revision> {
    if s == "USECL" {
        return Some(Revision::UseCl);
    }
    s.parse().ok().map(Revision::Number)
}

/// Escape a path for the wire: `;` → `;;`, `,` → `;.`.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            ';' => out.push_str(";;"),
            ',' => out.push_str(";."),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_path`].
pub fn unescape_path(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != ';' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(';') => out.push(';'),
            Some('.') => out.push(','),
            Some(other) => {
                out.push(';');
                out.push(other);
            }
            None => out.push(';'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(line: &str) -> FstatRecord {
        match decode_line(line).unwrap() {
            Line::Record(r) => r,
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn decodes_five_column_form() {
        let r = record("1234,dir/a.txt,7,42/utf8,0123456789ABCDEF0123456789ABCDEF");
        assert_eq!(r.changelist, 1234);
        assert_eq!(r.path, "dir/a.txt");
        assert_eq!(r.revision, Revision::Number(7));
        assert_eq!(r.size, SizeSpec::new(42, Flavor::Utf8));
        assert!(!r.is_delete());
    }

    #[test]
    fn path_escaping_round_trips() {
        let weird = "dir/a,b;c,;.d";
        let r = FstatRecord {
            changelist: 9,
            path: weird.to_owned(),
            revision: Revision::Number(1),
            size: SizeSpec::new(1, Flavor::Plain),
            checksum: "00000000000000000000000000000000".to_owned(),
        };
        let encoded = r.encode();
        assert!(!encoded.contains(",b"), "comma must be escaped: {encoded}");
        assert_eq!(record(&encoded), r);
    }

    #[test]
    fn delete_record_has_empty_checksum() {
        let r = record("21,dir/a.txt,0,0,");
        assert!(r.is_delete());
        assert_eq!(r, FstatRecord::delete(21, "dir/a.txt"));
    }

    #[test]
    fn usecl_revision() {
        let r = record("33,new/file,USECL,0,DEADFACEDEADFACEDEADFACEDEADFACE");
        assert_eq!(r.revision, Revision::UseCl);
        assert_eq!(r.encode(), "33,new/file,USECL,0,DEADFACEDEADFACEDEADFACEDEADFACE");
    }

    #[test]
    fn comments_and_blanks_decode_to_nothing() {
        assert_eq!(decode_line("").unwrap(), Line::Blank);
        assert_eq!(decode_line(COLUMNS_BANNER).unwrap(), Line::Blank);
    }

    #[test]
    fn passthrough_lines_are_preserved_verbatim() {
        let line = "#o4pass-warn#something odd";
        match decode_line(line).unwrap() {
            Line::Passthrough(raw) => assert_eq!(raw, line),
            other => panic!("{other:?}"),
        }
        assert_eq!(
            parse_passthrough(line),
            Some((PassKind::Warn, "something odd"))
        );
        assert_eq!(passthrough(PassKind::Err, "boom"), "#o4pass-err#boom");
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(decode_line("not a record").is_err());
        assert!(decode_line("1,2,3").is_err());
        assert!(decode_line("x,dir/a,1,1,ABC").is_err());
    }

    #[test]
    fn legacy_seven_column_is_normalized() {
        let r = record("800,3,120,edit,utf8,AAAABBBBCCCCDDDDAAAABBBBCCCCDDDD,dir/with,comma.txt");
        assert_eq!(r.changelist, 800);
        assert_eq!(r.path, "dir/with,comma.txt");
        assert_eq!(r.size, SizeSpec::new(120, Flavor::Utf8));
        // Re-emitted in five-column form with the comma escaped.
        assert_eq!(
            r.encode(),
            "800,dir/with;.comma.txt,3,120/utf8,AAAABBBBCCCCDDDDAAAABBBBCCCCDDDD"
        );
    }

    #[test]
    fn legacy_delete_normalizes_to_empty_checksum() {
        let r = record("801,0,0,move/delete,text,,gone/file.c");
        assert!(r.is_delete());
        assert_eq!(r.encode(), "801,gone/file.c,0,0,");
    }

    #[test]
    fn sort_is_descending_by_changelist_then_path() {
        let mut records = vec![
            record("10,b,1,1,AA"),
            record("20,a,1,1,AA"),
            record("10,a,1,1,AA"),
        ];
        sort_newest_first(&mut records);
        let order: Vec<_> = records.iter().map(|r| (r.changelist, r.path.as_str())).collect();
        assert_eq!(order, vec![(20, "a"), (10, "b"), (10, "a")]);
    }

    proptest! {
        #[test]
        fn round_trip(
            changelist in 1u64..1_000_000_000,
            path in "[a-zA-Z0-9_/;,. -]{1,40}",
            rev in 0u32..100_000,
            usecl in proptest::bool::ANY,
            bytes in 0u64..1_000_000_000,
            flavor_pick in 0u8..4,
            checksum in "[0-9A-F]{32}",
            delete in proptest::bool::ANY,
        ) {
            let flavor = match flavor_pick {
                0 => Flavor::Plain,
                1 => Flavor::Utf8,
                2 => Flavor::Utf16,
                _ => Flavor::Symlink,
            };
            let r = FstatRecord {
                changelist,
                path,
                revision: if usecl { Revision::UseCl } else { Revision::Number(rev) },
                size: if delete { SizeSpec::new(0, Flavor::Plain) } else { SizeSpec::new(bytes, flavor) },
                checksum: if delete { String::new() } else { checksum },
            };
            let encoded = r.encode();
            prop_assert!(!encoded.contains('\n'));
            // Any comma on the wire must be a field separator: exactly four.
            prop_assert_eq!(encoded.matches(',').count(), 4);
            prop_assert_eq!(record(&encoded), r);
        }
    }
}
