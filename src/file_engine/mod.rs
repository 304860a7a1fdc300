//! Line-oriented column file I/O (§4.4).
//!
//! Every operation here is synchronous: it reads/writes real file
//! descriptors with `std::fs`, optionally through a gzip stream when the
//! table's `.compression.config` marker is present. The async surface lives
//! one layer up — [`crate::engine::Engine`]'s public methods are `async fn`
//! and offload this module's blocking work to `tokio::task::spawn_blocking`,
//! so a slow disk stalls one task's executor slot, not the runtime.
//!
//! Every mutating operation (append/prepend/replace/remove) writes a full
//! replacement file under the table's `.tmp/` directory and returns its
//! path; the caller renames it over the original only once every column's
//! temp file has been written successfully, so a crash mid-write never
//! corrupts the original (§4.9's "format, then swap" pipeline).

pub mod lock;

use crate::error::{io_at, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Which lines a read should return.
#[derive(Debug, Clone)]
pub enum LineSelector {
    /// Every non-empty line.
    All,
    /// Only the last line in the file (line number unknown up front).
    Last,
    /// A fixed set of 1-based line numbers.
    Lines(HashSet<u64>),
}

fn open_reader(path: &Path, compressed: bool) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| io_at(path, e))?;
    if compressed {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn open_writer(path: &Path, compressed: bool) -> Result<Box<dyn Write>> {
    let file = File::create(path).map_err(|e| io_at(path, e))?;
    if compressed {
        Ok(Box::new(GzEncoder::new(file, Compression::default())))
    } else {
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Read the lines selected by `selector`. Returns `(line_number -> raw
/// value, total_lines_seen)`. `total_lines_seen` is only an authoritative
/// file length when `selector` is [`LineSelector::All`] or
/// [`LineSelector::Last`]: a [`LineSelector::Lines`] read short-circuits as
/// soon as every requested line number has been seen, so its total is only
/// "how far the scan got", not the file's real length.
pub fn get(path: &Path, selector: &LineSelector, compressed: bool) -> Result<(BTreeMap<u64, String>, u64)> {
    if !path.exists() {
        return Ok((BTreeMap::new(), 0));
    }
    let reader = open_reader(path, compressed)?;
    let mut out = BTreeMap::new();
    let mut last_seen = 0u64;
    let mut remaining = match selector {
        LineSelector::Lines(set) => Some(set.clone()),
        _ => None,
    };
    let mut last_line: Option<(u64, String)> = None;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_at(path, e))?;
        let line_no = (idx + 1) as u64;
        last_seen = line_no;

        match selector {
            LineSelector::All => {
                if !line.is_empty() {
                    out.insert(line_no, line);
                }
            }
            LineSelector::Last => {
                last_line = Some((line_no, line));
            }
            LineSelector::Lines(_) => {
                if let Some(set) = remaining.as_mut() {
                    if set.remove(&line_no) {
                        out.insert(line_no, line);
                        if set.is_empty() {
                            break;
                        }
                    }
                }
            }
        }
    }

    if let LineSelector::Last = selector {
        if let Some((n, l)) = last_line {
            if !l.is_empty() {
                out.insert(n, l);
            }
        }
    }

    Ok((out, last_seen))
}

/// Count non-empty lines (optionally restricted to a [`LineSelector::Lines`]
/// set); always scans to EOF.
pub fn count(path: &Path, selector: &LineSelector, compressed: bool) -> Result<u64> {
    let (lines, total) = get_full(path, selector, compressed)?;
    match selector {
        LineSelector::All => Ok(total),
        _ => Ok(lines.len() as u64),
    }
}

/// Like [`get`], but never short-circuits — used when the caller needs an
/// authoritative line count alongside a finite selector.
fn get_full(path: &Path, selector: &LineSelector, compressed: bool) -> Result<(BTreeMap<u64, String>, u64)> {
    if !path.exists() {
        return Ok((BTreeMap::new(), 0));
    }
    let reader = open_reader(path, compressed)?;
    let mut out = BTreeMap::new();
    let mut total = 0u64;
    let wanted = match selector {
        LineSelector::Lines(set) => Some(set),
        _ => None,
    };

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_at(path, e))?;
        let line_no = (idx + 1) as u64;
        total = line_no;
        if line.is_empty() {
            continue;
        }
        match wanted {
            Some(set) if set.contains(&line_no) => {
                out.insert(line_no, line);
            }
            Some(_) => {}
            None => {
                out.insert(line_no, line);
            }
        }
    }
    Ok((out, total))
}

fn numeric_values(path: &Path, selector: &LineSelector, compressed: bool) -> Result<Vec<f64>> {
    let (lines, _) = get_full(path, selector, compressed)?;
    Ok(lines.values().filter_map(|l| l.parse::<f64>().ok()).collect())
}

pub fn sum(path: &Path, selector: &LineSelector, compressed: bool) -> Result<f64> {
    Ok(numeric_values(path, selector, compressed)?.into_iter().sum())
}

pub fn min(path: &Path, selector: &LineSelector, compressed: bool) -> Result<Option<f64>> {
    Ok(numeric_values(path, selector, compressed)?
        .into_iter()
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v)))))
}

pub fn max(path: &Path, selector: &LineSelector, compressed: bool) -> Result<Option<f64>> {
    Ok(numeric_values(path, selector, compressed)?
        .into_iter()
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v)))))
}

/// Write the replacement-file-then-rename contents for appending `values`
/// as new lines after whatever's already in `path`. Returns the temp file
/// path; the caller is responsible for renaming it over `path`.
pub fn append(path: &Path, values: &[String], compressed: bool, tmp_dir: &Path) -> Result<PathBuf> {
    let tmp_path = tmp_dir.join(unique_tmp_name(path));
    let mut writer = open_writer(&tmp_path, compressed)?;

    if path.exists() {
        let reader = open_reader(path, compressed)?;
        for line in reader.lines() {
            writeln!(writer, "{}", line.map_err(|e| io_at(path, e))?).map_err(|e| io_at(&tmp_path, e))?;
        }
    }
    for v in values {
        writeln!(writer, "{v}").map_err(|e| io_at(&tmp_path, e))?;
    }
    Ok(tmp_path)
}

/// Same as [`append`] but `values` are written before the existing content.
pub fn prepend(path: &Path, values: &[String], compressed: bool, tmp_dir: &Path) -> Result<PathBuf> {
    let tmp_path = tmp_dir.join(unique_tmp_name(path));
    let mut writer = open_writer(&tmp_path, compressed)?;

    for v in values {
        writeln!(writer, "{v}").map_err(|e| io_at(&tmp_path, e))?;
    }
    if path.exists() {
        let reader = open_reader(path, compressed)?;
        for line in reader.lines() {
            writeln!(writer, "{}", line.map_err(|e| io_at(path, e))?).map_err(|e| io_at(&tmp_path, e))?;
        }
    }
    Ok(tmp_path)
}

/// What to replace and with what.
pub enum Replacement {
    /// Replace every line with the same value.
    All(String),
    /// Replace specific 1-based line numbers; a number past the current
    /// end of file pads the gap with empty lines.
    Lines(BTreeMap<u64, String>),
}

/// Rewrite `path` applying `replacement`, returning the temp file path.
pub fn replace(path: &Path, replacement: &Replacement, compressed: bool, tmp_dir: &Path) -> Result<PathBuf> {
    let tmp_path = tmp_dir.join(unique_tmp_name(path));
    let mut writer = open_writer(&tmp_path, compressed)?;
    let mut last_line_no = 0u64;

    if path.exists() {
        let reader = open_reader(path, compressed)?;
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| io_at(path, e))?;
            let line_no = (idx + 1) as u64;
            last_line_no = line_no;
            let out = match replacement {
                Replacement::All(v) => v.clone(),
                Replacement::Lines(map) => map.get(&line_no).cloned().unwrap_or(line),
            };
            writeln!(writer, "{out}").map_err(|e| io_at(&tmp_path, e))?;
        }
    }

    if let Replacement::Lines(map) = replacement {
        for (&line_no, value) in map {
            if line_no <= last_line_no {
                continue;
            }
            for pad in (last_line_no + 1)..line_no {
                let _ = pad;
                writeln!(writer).map_err(|e| io_at(&tmp_path, e))?;
            }
            writeln!(writer, "{value}").map_err(|e| io_at(&tmp_path, e))?;
            last_line_no = line_no;
        }
    }

    Ok(tmp_path)
}

/// Rewrite `path` dropping the given 1-based line numbers entirely (the
/// file shrinks; later lines shift up), returning the temp file path.
pub fn remove(path: &Path, line_numbers: &HashSet<u64>, compressed: bool, tmp_dir: &Path) -> Result<PathBuf> {
    let tmp_path = tmp_dir.join(unique_tmp_name(path));
    let mut writer = open_writer(&tmp_path, compressed)?;

    if path.exists() {
        let reader = open_reader(path, compressed)?;
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| io_at(path, e))?;
            let line_no = (idx + 1) as u64;
            if line_numbers.contains(&line_no) {
                continue;
            }
            writeln!(writer, "{line}").map_err(|e| io_at(&tmp_path, e))?;
        }
    }
    Ok(tmp_path)
}

/// Rename every `(temp, final)` pair in order; if one rename fails, unlink
/// the remaining un-renamed temp files before propagating the error so a
/// partially-applied mutation never leaves stray `.tmp` files behind.
pub fn rename_batch(pairs: &[(PathBuf, PathBuf)]) -> Result<()> {
    for (i, (tmp, dest)) in pairs.iter().enumerate() {
        if let Err(e) = std::fs::rename(tmp, dest) {
            for (leftover_tmp, _) in &pairs[i..] {
                let _ = std::fs::remove_file(leftover_tmp);
            }
            return Err(io_at(dest.clone(), e));
        }
    }
    Ok(())
}

fn unique_tmp_name(original: &Path) -> String {
    let stem = original.file_name().and_then(|n| n.to_str()).unwrap_or("column");
    let pid = std::process::id();
    let counter = TMP_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!("{stem}.{pid}.{counter}.tmp")
}

static TMP_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn lines(s: &str) -> Vec<String> {
        s.lines().map(str::to_string).collect()
    }

    #[test]
    fn append_then_get_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt");
        let tmp = append(&path, &lines("a\nb"), false, dir.path()).unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        let tmp2 = append(&path, &lines("c"), false, dir.path()).unwrap();
        std::fs::rename(&tmp2, &path).unwrap();

        let (got, total) = get(&path, &LineSelector::All, false).unwrap();
        assert_eq!(total, 3);
        assert_eq!(got.get(&1).unwrap(), "a");
        assert_eq!(got.get(&3).unwrap(), "c");
    }

    #[test]
    fn prepend_inserts_before_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt");
        std::fs::write(&path, "b\n").unwrap();

        let tmp = prepend(&path, &lines("a"), false, dir.path()).unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        let (got, _) = get(&path, &LineSelector::All, false).unwrap();
        assert_eq!(got.get(&1).unwrap(), "a");
        assert_eq!(got.get(&2).unwrap(), "b");
    }

    #[test]
    fn lines_selector_short_circuits_on_hit_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();

        let mut wanted = HashSet::new();
        wanted.insert(2u64);
        let (got, scanned_to) = get(&path, &LineSelector::Lines(wanted), false).unwrap();
        assert_eq!(got.get(&2).unwrap(), "b");
        assert_eq!(scanned_to, 2, "should stop at the requested line, not read to EOF");
    }

    #[test]
    fn replace_lines_pads_gaps_with_empty_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt");
        std::fs::write(&path, "a\n").unwrap();

        let mut map = BTreeMap::new();
        map.insert(3u64, "c".to_string());
        let tmp = replace(&path, &Replacement::Lines(map), false, dir.path()).unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "a\n\nc\n");
    }

    #[test]
    fn remove_drops_requested_lines_and_shifts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt");
        std::fs::write(&path, "a\nb\nc\n").unwrap();

        let mut drop = HashSet::new();
        drop.insert(2u64);
        let tmp = remove(&path, &drop, false, dir.path()).unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        let (got, total) = get(&path, &LineSelector::All, false).unwrap();
        assert_eq!(total, 2);
        assert_eq!(got.get(&2).unwrap(), "c");
    }

    #[test]
    fn sum_min_max_ignore_non_numeric_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt");
        std::fs::write(&path, "3\n\n7\nnot-a-number\n1\n").unwrap();

        assert_eq!(sum(&path, &LineSelector::All, false).unwrap(), 11.0);
        assert_eq!(min(&path, &LineSelector::All, false).unwrap(), Some(1.0));
        assert_eq!(max(&path, &LineSelector::All, false).unwrap(), Some(7.0));
    }

    #[test]
    fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("col.txt.gz");
        let tmp = append(&path, &lines("x\ny"), true, dir.path()).unwrap();
        std::fs::rename(&tmp, &path).unwrap();

        let (got, total) = get(&path, &LineSelector::All, true).unwrap();
        assert_eq!(total, 2);
        assert_eq!(got.get(&1).unwrap(), "x");
    }

    #[test]
    fn rename_batch_cleans_up_remaining_temps_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good_tmp = dir.path().join("good.tmp");
        std::fs::write(&good_tmp, "ok").unwrap();
        let bad_tmp = dir.path().join("bad.tmp");
        std::fs::write(&bad_tmp, "ok").unwrap();

        // Point the first destination at a directory that doesn't exist so
        // the rename fails partway through the batch.
        let bad_dest = dir.path().join("missing-dir").join("dest");
        let good_dest = dir.path().join("dest-ok");

        let result = rename_batch(&[(bad_tmp.clone(), bad_dest), (good_tmp.clone(), good_dest)]);
        assert!(result.is_err());
        assert!(!good_tmp.exists(), "leftover temp files must be cleaned up on failure");
    }
}
