//! Orphan recovery
//!
//! A crash can leave finalized or half-written files in the staging
//! directory. On startup, each partition's loop scans its topic directory:
//!
//! - files whose first offset is at or above the committed boundary are
//!   adopted as sealed entries and re-uploaded (object names encode the
//!   first offset, so the overwrite is idempotent),
//! - files entirely below the boundary belong to a committed cycle whose
//!   local cleanup did not finish; they are deleted,
//! - files that do not parse, or whose records do not read back, are moved
//!   to a quarantine directory and never deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use loghaul_core::codec::FileCodec;
use loghaul_core::{Clock, LogFilePath, Result, ShipperError};

use crate::registry::RegistryEntry;

/// Directory (under the staging root) holding quarantined files
pub const QUARANTINE_DIR: &str = ".quarantine";

/// Scan one (topic, kafka-partition) staging slice.
///
/// Returns recovered entries sorted by first offset, ready for
/// [`FileRegistry::adopt`](crate::registry::FileRegistry::adopt) and an
/// immediate flush.
pub fn scan_partition(
    local_root: &str,
    topic: &str,
    kafka_partition: u32,
    committed: Option<u64>,
    codec: &Arc<dyn FileCodec>,
    clock: &Clock,
) -> Result<Vec<RegistryEntry>> {
    let topic_dir = Path::new(local_root).join(topic);
    if !topic_dir.exists() {
        return Ok(Vec::new());
    }

    let mut adopted = Vec::new();
    for file in walk_files(&topic_dir)? {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // checksum sidecars and other dotfiles ride along with their data file
        if name.starts_with('.') {
            continue;
        }

        let path = match LogFilePath::parse(local_root, &file.to_string_lossy()) {
            Ok(path) => path,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "unparseable staging file, quarantining");
                quarantine(local_root, &file)?;
                continue;
            }
        };
        if path.kafka_partitions()[0] != kafka_partition {
            continue; // owned by another loop
        }

        let committed_boundary = committed.unwrap_or(0);
        if path.first_offset() < committed_boundary {
            info!(file = %file.display(), "staging file below committed boundary, discarding");
            std::fs::remove_file(&file)?;
            continue;
        }

        match read_back(&file, &path, codec) {
            Ok(Some((record_count, last_offset))) => {
                let bytes = std::fs::metadata(&file)?.len();
                info!(
                    file = %file.display(),
                    first_offset = path.first_offset(),
                    last_offset,
                    record_count,
                    "recovered staging file"
                );
                adopted.push(RegistryEntry::sealed(
                    path,
                    file,
                    bytes,
                    record_count,
                    last_offset,
                    clock.now_millis(),
                ));
            }
            Ok(None) => {
                info!(file = %file.display(), "empty staging file, discarding");
                std::fs::remove_file(&file)?;
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "unreadable staging file, quarantining");
                quarantine(local_root, &file)?;
            }
        }
    }

    adopted.sort_by_key(|entry| entry.first_offset);
    Ok(adopted)
}

/// Re-read a staged file to recover its record count and last offset.
/// `None` means the file holds no records.
fn read_back(
    file: &Path,
    path: &LogFilePath,
    codec: &Arc<dyn FileCodec>,
) -> Result<Option<(u64, u64)>> {
    let mut reader = codec.open_reader(file, path.first_offset())?;
    let mut record_count = 0u64;
    let mut last_offset = None;
    while let Some(kv) = reader.next()? {
        record_count += 1;
        last_offset = Some(kv.offset);
    }
    Ok(last_offset.map(|offset| (record_count, offset)))
}

fn quarantine(local_root: &str, file: &Path) -> Result<()> {
    let quarantine_dir = Path::new(local_root).join(QUARANTINE_DIR);
    std::fs::create_dir_all(&quarantine_dir)?;
    let name = file
        .file_name()
        .ok_or_else(|| ShipperError::malformed_path(format!("{} has no basename", file.display())))?;
    std::fs::rename(file, quarantine_dir.join(name))?;
    Ok(())
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                if path.file_name().and_then(|n| n.to_str()) != Some(QUARANTINE_DIR) {
                    pending.push(path);
                }
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loghaul_core::codec::DelimitedCodec;
    use loghaul_core::KeyValue;
    use tempfile::tempdir;

    fn codec() -> Arc<dyn FileCodec> {
        Arc::new(DelimitedCodec::new(b'\n', Some(b'\n'), false))
    }

    fn stage_file(root: &Path, relative: &str, records: &[(u64, &'static [u8])]) -> PathBuf {
        let file = root.join(relative);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        let codec = codec();
        let mut writer = codec.open_writer(&file).unwrap();
        for (offset, value) in records {
            writer.write(&KeyValue::new(*offset, *value)).unwrap();
        }
        writer.close().unwrap();
        file
    }

    #[test]
    fn test_empty_root_is_empty_scan() {
        let dir = tempdir().unwrap();
        let adopted = scan_partition(
            dir.path().to_str().unwrap(),
            "events",
            0,
            None,
            &codec(),
            &Clock::fixed(0),
        )
        .unwrap();
        assert!(adopted.is_empty());
    }

    #[test]
    fn test_adopts_files_at_or_above_committed() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        stage_file(
            dir.path(),
            "events/dt=2014-05-13/0_3_00000000000000000100.log",
            &[(100, b"a"), (101, b"b")],
        );

        let adopted =
            scan_partition(&root, "events", 3, Some(100), &codec(), &Clock::fixed(0)).unwrap();
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].first_offset, 100);
        assert_eq!(adopted[0].last_offset, 101);
        assert_eq!(adopted[0].record_count, 2);
        assert!(adopted[0].sealed);
    }

    #[test]
    fn test_discards_files_below_committed() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let file = stage_file(
            dir.path(),
            "events/dt=2014-05-13/0_3_00000000000000000100.log",
            &[(100, b"a")],
        );

        let adopted =
            scan_partition(&root, "events", 3, Some(101), &codec(), &Clock::fixed(0)).unwrap();
        assert!(adopted.is_empty());
        assert!(!file.exists());
    }

    #[test]
    fn test_skips_other_partitions() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let file = stage_file(
            dir.path(),
            "events/dt=2014-05-13/0_7_00000000000000000100.log",
            &[(100, b"a")],
        );

        let adopted =
            scan_partition(&root, "events", 3, None, &codec(), &Clock::fixed(0)).unwrap();
        assert!(adopted.is_empty());
        assert!(file.exists());
    }

    #[test]
    fn test_quarantines_unparseable_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let file = dir.path().join("events/dt=2014-05-13/garbage-name.log");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"whatever\n").unwrap();

        let adopted =
            scan_partition(&root, "events", 3, None, &codec(), &Clock::fixed(0)).unwrap();
        assert!(adopted.is_empty());
        assert!(!file.exists());
        assert!(dir
            .path()
            .join(QUARANTINE_DIR)
            .join("garbage-name.log")
            .exists());
    }

    #[test]
    fn test_quarantines_files_with_framing_errors() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let file = dir.path().join("events/dt=2014-05-13/0_3_00000000000000000100.log");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        // trailing record without delimiter
        std::fs::write(&file, b"complete\npartial").unwrap();

        let adopted =
            scan_partition(&root, "events", 3, None, &codec(), &Clock::fixed(0)).unwrap();
        assert!(adopted.is_empty());
        assert!(!file.exists());
        assert!(dir
            .path()
            .join(QUARANTINE_DIR)
            .join("0_3_00000000000000000100.log")
            .exists());
    }

    #[test]
    fn test_discards_empty_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let file = stage_file(
            dir.path(),
            "events/dt=2014-05-13/0_3_00000000000000000100.log",
            &[],
        );

        let adopted =
            scan_partition(&root, "events", 3, None, &codec(), &Clock::fixed(0)).unwrap();
        assert!(adopted.is_empty());
        assert!(!file.exists());
    }

    #[test]
    fn test_adopted_entries_sorted_by_offset() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        stage_file(
            dir.path(),
            "events/dt=2014-05-14/0_3_00000000000000000200.log",
            &[(200, b"b")],
        );
        stage_file(
            dir.path(),
            "events/dt=2014-05-13/0_3_00000000000000000100.log",
            &[(100, b"a")],
        );

        let adopted =
            scan_partition(&root, "events", 3, None, &codec(), &Clock::fixed(0)).unwrap();
        let offsets: Vec<u64> = adopted.iter().map(|e| e.first_offset).collect();
        assert_eq!(offsets, vec![100, 200]);
    }
}
