//! Locating a single database inside a `pg_dumpall` stream.
//!
//! A section starts at the line `-- Database "<name>" dump` and runs up to the
//! next such line or to `-- PostgreSQL database cluster dump complete`.
//! Files are scanned line by line; nothing is held in memory beyond one line.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::errors::Result;

const SECTION_PREFIX: &str = "-- Database \"";
const SECTION_SUFFIX: &str = "\" dump";
const CLUSTER_END: &str = "-- PostgreSQL database cluster dump complete";

enum Line {
    SectionStart(String),
    ClusterEnd,
    Other,
}

fn classify(line: &[u8]) -> Line {
    let Ok(text) = std::str::from_utf8(line) else {
        return Line::Other;
    };
    let text = text.trim_end_matches(['\n', '\r']);
    if text == CLUSTER_END {
        return Line::ClusterEnd;
    }
    match text
        .strip_prefix(SECTION_PREFIX)
        .and_then(|rest| rest.strip_suffix(SECTION_SUFFIX))
    {
        Some(name) => Line::SectionStart(name.to_string()),
        None => Line::Other,
    }
}

/// Header line that opens the section for `name`.
pub fn section_header(name: &str) -> String {
    format!("{}{}{}\n", SECTION_PREFIX, name, SECTION_SUFFIX)
}

pub fn cluster_footer() -> String {
    format!("{}\n", CLUSTER_END)
}

/// Database names in the order their sections appear.
pub async fn list_sections(path: &Path) -> Result<Vec<String>> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut line = Vec::new();
    let mut names = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        match classify(&line) {
            Line::SectionStart(name) => names.push(name),
            Line::ClusterEnd => break,
            Line::Other => {}
        }
    }
    Ok(names)
}

pub async fn contains_section(path: &Path, name: &str) -> Result<bool> {
    Ok(list_sections(path).await?.iter().any(|n| n == name))
}

/// Copies the section for `name` (header included) into `dest` and returns the
/// number of bytes written; 0 means the section is absent and `dest` is not
/// created.
pub async fn extract_section(path: &Path, name: &str, dest: &Path) -> Result<u64> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut line = Vec::new();
    let mut writer: Option<BufWriter<File>> = None;
    let mut written = 0u64;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        match (classify(&line), writer.is_some()) {
            (Line::SectionStart(found), false) if found == name => {
                writer = Some(BufWriter::new(File::create(dest).await?));
            }
            (Line::SectionStart(_), true) | (Line::ClusterEnd, true) => break,
            (Line::ClusterEnd, false) => break,
            _ => {}
        }
        if let Some(out) = writer.as_mut() {
            out.write_all(&line).await?;
            written += line.len() as u64;
        }
    }

    if let Some(mut out) = writer {
        out.flush().await?;
        out.get_ref().sync_all().await?;
    }
    Ok(written)
}
