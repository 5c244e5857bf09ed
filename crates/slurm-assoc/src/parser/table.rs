//! Fixed-width tables printed by `sshare` and `sreport`.
//!
//! ```text
//!              Account       User  RawShares  NormShares
//! -------------------- ---------- ---------- -----------
//! lab                                      1    0.500000
//! ```
//!
//! Column boundaries are given by the runs of dashes in the underline.
use std::collections::BTreeMap;
use std::ops::Range;

use crate::SlurmResult;
use crate::error::parse_error;

pub type TableRow = BTreeMap<String, String>;

/// Returns the byte ranges of dash runs, if `line` is an underline with at least two columns.
/// Single dash runs are used by `sreport` for banners and are not table underlines.
fn underline_columns(line: &str) -> Option<Vec<Range<usize>>> {
    let line = line.trim_end();
    if line.is_empty() || !line.chars().all(|c| c == '-' || c == ' ') {
        return None;
    }
    let mut columns = Vec::new();
    let mut start = None;
    for (index, c) in line.char_indices() {
        match (c, start) {
            ('-', None) => start = Some(index),
            (' ', Some(begin)) => {
                columns.push(begin..index);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = start {
        columns.push(begin..line.len());
    }
    (columns.len() >= 2).then_some(columns)
}

/// Slices `line` into cells. Returns `None` when the line does not fit the column layout.
fn split_row(line: &str, columns: &[Range<usize>]) -> Option<Vec<String>> {
    let line = line.trim_end();
    let width = columns.last().map(|c| c.end).unwrap_or(0);
    if line.len() > width {
        return None;
    }

    let mut cells = Vec::with_capacity(columns.len());
    let mut previous_end = 0;
    for column in columns {
        // Text between two columns has to be blank, otherwise a value overflowed its column.
        let gap = slice(line, previous_end..column.start)?;
        if !gap.trim().is_empty() {
            return None;
        }
        cells.push(slice(line, column.clone())?.trim().to_string());
        previous_end = column.end;
    }
    Some(cells)
}

/// Like `str::get`, but treats everything past the end of the line as empty.
fn slice(line: &str, range: Range<usize>) -> Option<&str> {
    let end = range.end.min(line.len());
    let start = range.start.min(end);
    line.get(start..end)
}

/// Parses a fixed-width table into one map per row, keyed by the header names.
///
/// Lines before the header (e.g. `CLUSTER: name` or report banners) are ignored.
/// Rows that do not fit the column layout are skipped with a warning.
pub fn parse_fixed_width(text: &str) -> SlurmResult<Vec<TableRow>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let lines: Vec<&str> = text.lines().collect();
    let Some((underline_index, columns)) = lines.iter().enumerate().skip(1).find_map(|(i, line)| {
        if lines[i - 1].trim().is_empty() {
            return None;
        }
        underline_columns(line).map(|columns| (i, columns))
    }) else {
        return parse_error("Table has no header underline".to_string());
    };

    let Some(header) = split_row(lines[underline_index - 1], &columns) else {
        return parse_error(format!(
            "Table header `{}` does not match its underline",
            lines[underline_index - 1].trim()
        ));
    };

    let mut rows = Vec::new();
    for line in &lines[underline_index + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        match split_row(line, &columns) {
            Some(cells) => rows.push(header.iter().cloned().zip(cells).collect()),
            None => log::warn!("Skipping table row that does not fit its columns: `{line}`"),
        }
    }
    Ok(rows)
}
