// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};

/// Append-only log file with daily and size-based rotation.
///
/// Rotation renames the live file to `<stem>.YYYY-MM-DD.log` (a numeric
/// suffix is added when that name is taken) and reopens a fresh file.
/// Archives older than `max_days` are removed opportunistically after each
/// rotation.
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    opened: NaiveDate,
    max_size_bytes: u64,
    max_days: u32,
}

impl RotatingFile {
    pub fn open(path: &Path, max_size_mb: u64, max_days: u32) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            opened: Local::now().date_naive(),
            max_size_bytes: max_size_mb.saturating_mul(1024 * 1024),
            max_days,
        })
    }

    /// Append one line (terminating LF added here), rotating first if due.
    pub fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.rotate_if_due()?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        Ok(())
    }

    fn rotate_if_due(&mut self) -> anyhow::Result<()> {
        let today = Local::now().date_naive();
        let size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        let date_rolled = today != self.opened;
        let size_rolled = self.max_size_bytes > 0 && size >= self.max_size_bytes;
        if !date_rolled && !size_rolled {
            return Ok(());
        }

        let archive = self.archive_name(self.opened);
        // Rename can race an external cleanup; a miss only loses the archive,
        // never the live stream.
        let _ = std::fs::rename(&self.path, &archive);
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.opened = today;
        self.prune_archives();
        Ok(())
    }

    fn archive_name(&self, date: NaiveDate) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "agent".into());
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let base = dir.join(format!("{stem}.{}.log", date.format("%Y-%m-%d")));
        if !base.exists() {
            return base;
        }
        for n in 1..1000 {
            let candidate = dir.join(format!("{stem}.{}.{n}.log", date.format("%Y-%m-%d")));
            if !candidate.exists() {
                return candidate;
            }
        }
        base
    }

    fn prune_archives(&self) {
        let Some(dir) = self.path.parent() else { return };
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let cutoff = Local::now().date_naive() - chrono::Days::new(self.max_days as u64);
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&format!("{stem}.")) else {
                continue;
            };
            // "<date>.log" or "<date>.<n>.log"
            let date_part = rest.split('.').next().unwrap_or("");
            if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                if date < cutoff {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines_with_lf() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.log");
        let mut f = RotatingFile::open(&path, 10, 7).unwrap();
        f.write_line("{\"a\":1}").unwrap();
        f.write_line("{\"b\":2}").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn size_rotation_renames_to_dated_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.log");
        // 0 MB threshold rounds to 0 bytes — force max_size via direct field
        let mut f = RotatingFile::open(&path, 1, 7).unwrap();
        f.max_size_bytes = 16;
        f.write_line(&"x".repeat(32)).unwrap(); // first write, below threshold check
        f.write_line("next").unwrap(); // triggers rotation
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        let archive = tmp.path().join(format!("agent.{today}.log"));
        assert!(archive.exists(), "expected archive {}", archive.display());
        let live = std::fs::read_to_string(&path).unwrap();
        assert_eq!(live, "next\n");
    }

    #[test]
    fn archive_name_dedups_with_numeric_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.log");
        let f = RotatingFile::open(&path, 1, 7).unwrap();
        let date = Local::now().date_naive();
        let first = f.archive_name(date);
        std::fs::write(&first, "x").unwrap();
        let second = f.archive_name(date);
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with(".1.log"));
    }

    #[test]
    fn prune_removes_expired_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.log");
        let old = tmp.path().join("agent.2020-01-01.log");
        std::fs::write(&old, "ancient").unwrap();
        let f = RotatingFile::open(&path, 1, 7).unwrap();
        f.prune_archives();
        assert!(!old.exists());
    }
}
