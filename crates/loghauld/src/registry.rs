//! Per-partition file registry
//!
//! Tracks the open output files of one (topic, kafka-partition), keyed by
//! their logical partitions. Each consumer loop owns its registry slice
//! outright, so appends are lock-free by construction.
//!
//! For a given slice, the offset ranges of all entries together cover a
//! contiguous prefix of consumed offsets: a parser-skipped message is still
//! covered by whichever entry last advanced `last_offset` past it. The
//! uploader derives the next committed boundary from
//! [`max_last_offset`](FileRegistry::max_last_offset).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use loghaul_core::codec::{FileCodec, RecordWriter};
use loghaul_core::{Clock, KeyValue, LogFilePath, Result, ShipperError};

/// One open (or sealed) output file
pub struct RegistryEntry {
    /// Logical path, rooted at the local staging directory
    pub path: LogFilePath,
    /// Where the bytes live locally
    pub local_path: PathBuf,
    /// Live writer; `None` once sealed or for recovered orphans
    pub writer: Option<Box<dyn RecordWriter>>,
    /// On-disk bytes, from the writer's counting stream
    pub bytes_written: u64,
    /// Records appended
    pub record_count: u64,
    /// Creation stamp, epoch millis
    pub created_at_ms: i64,
    /// Last append stamp, epoch millis
    pub last_write_at_ms: i64,
    /// Offset of the first record in the file
    pub first_offset: u64,
    /// Offset of the last record appended
    pub last_offset: u64,
    /// Sealed entries accept no further appends
    pub sealed: bool,
}

impl RegistryEntry {
    /// Rebuild an entry for an already-written file (crash recovery);
    /// it starts out sealed.
    pub fn sealed(
        path: LogFilePath,
        local_path: PathBuf,
        bytes_written: u64,
        record_count: u64,
        last_offset: u64,
        now_ms: i64,
    ) -> Self {
        let first_offset = path.first_offset();
        Self {
            path,
            local_path,
            writer: None,
            bytes_written,
            record_count,
            created_at_ms: now_ms,
            last_write_at_ms: now_ms,
            first_offset,
            last_offset,
            sealed: true,
        }
    }
}

/// Open writers of one (topic, kafka-partition), keyed by logical partitions
pub struct FileRegistry {
    topic: String,
    kafka_partition: u32,
    generation: u32,
    local_root: String,
    extension: String,
    codec: Arc<dyn FileCodec>,
    clock: Clock,
    entries: HashMap<Vec<String>, RegistryEntry>,
}

impl FileRegistry {
    pub fn new(
        topic: impl Into<String>,
        kafka_partition: u32,
        generation: u32,
        local_root: impl Into<String>,
        extension: impl Into<String>,
        codec: Arc<dyn FileCodec>,
        clock: Clock,
    ) -> Self {
        Self {
            topic: topic.into(),
            kafka_partition,
            generation,
            local_root: local_root.into(),
            extension: extension.into(),
            codec,
            clock,
            entries: HashMap::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kafka_partition(&self) -> u32 {
        self.kafka_partition
    }

    pub fn local_root(&self) -> &str {
        &self.local_root
    }

    pub fn codec(&self) -> Arc<dyn FileCodec> {
        self.codec.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    /// Existing entry for the logical partitions, or a fresh one whose
    /// first offset is the next write's offset.
    pub fn get_or_open(
        &mut self,
        partitions: &[String],
        first_offset: u64,
        channel_identifier: &[String],
    ) -> Result<&mut RegistryEntry> {
        if !self.entries.contains_key(partitions) {
            let path = LogFilePath::single(
                self.local_root.clone(),
                self.topic.clone(),
                partitions.to_vec(),
                self.generation,
                self.kafka_partition,
                first_offset,
                self.extension.clone(),
            )?
            .with_channel_identifier(channel_identifier.to_vec());

            let local_path = PathBuf::from(path.render());
            if let Some(parent) = local_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let writer = self.codec.open_writer(&local_path)?;
            let now_ms = self.clock.now_millis();

            tracing::debug!(
                topic = %self.topic,
                kafka_partition = self.kafka_partition,
                file = %local_path.display(),
                "opened output file"
            );

            self.entries.insert(
                partitions.to_vec(),
                RegistryEntry {
                    path,
                    local_path,
                    writer: Some(writer),
                    bytes_written: 0,
                    record_count: 0,
                    created_at_ms: now_ms,
                    last_write_at_ms: now_ms,
                    first_offset,
                    last_offset: first_offset,
                    sealed: false,
                },
            );
        }
        Ok(self
            .entries
            .get_mut(partitions)
            .expect("entry inserted above"))
    }

    /// Append a record to the partitions' file, creating it if needed
    pub fn append(
        &mut self,
        partitions: &[String],
        kv: &KeyValue,
        channel_identifier: &[String],
    ) -> Result<()> {
        let now_ms = self.clock.now_millis();
        let entry = self.get_or_open(partitions, kv.offset, channel_identifier)?;
        if entry.sealed {
            return Err(ShipperError::invariant(format!(
                "append to sealed file {}",
                entry.local_path.display()
            )));
        }
        let writer = entry
            .writer
            .as_mut()
            .ok_or_else(|| ShipperError::invariant("open entry without writer"))?;
        writer.write(kv)?;
        entry.bytes_written = writer.length();
        entry.record_count += 1;
        entry.last_offset = kv.offset;
        entry.last_write_at_ms = now_ms;
        Ok(())
    }

    /// Adopt a recovered entry (crash recovery)
    pub fn adopt(&mut self, entry: RegistryEntry) {
        self.entries
            .insert(entry.path.partitions().to_vec(), entry);
    }

    /// Close every writer; sealed entries accept no more appends and their
    /// byte counts are final.
    pub fn seal_all(&mut self) -> Result<()> {
        for entry in self.entries.values_mut() {
            if let Some(mut writer) = entry.writer.take() {
                writer.close()?;
                entry.bytes_written = writer.length();
            }
            entry.sealed = true;
        }
        Ok(())
    }

    /// Highest offset covered by any entry; the uploader's committed
    /// candidate is this plus one
    pub fn max_last_offset(&self) -> Option<u64> {
        self.entries.values().map(|e| e.last_offset).max()
    }

    /// Largest on-disk file size
    pub fn max_bytes_written(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.bytes_written)
            .max()
            .unwrap_or(0)
    }

    /// Largest record count
    pub fn max_record_count(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.record_count)
            .max()
            .unwrap_or(0)
    }

    /// Creation stamp of the oldest entry
    pub fn min_created_at_ms(&self) -> Option<i64> {
        self.entries.values().map(|e| e.created_at_ms).min()
    }

    /// Most recent append stamp across entries
    pub fn max_last_write_at_ms(&self) -> Option<i64> {
        self.entries.values().map(|e| e.last_write_at_ms).max()
    }

    /// Delete all local files (and checksum sidecars) and forget the
    /// entries. Called by the uploader after offsets were committed.
    pub fn drop_all(&mut self) -> Result<()> {
        for entry in self.entries.values_mut() {
            if let Some(mut writer) = entry.writer.take() {
                writer.close()?;
            }
            remove_if_exists(&entry.local_path)?;
            remove_if_exists(&PathBuf::from(entry.path.crc_path()))?;
        }
        self.entries.clear();
        Ok(())
    }
}

fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loghaul_core::codec::DelimitedCodec;
    use tempfile::tempdir;

    fn registry(root: &str, clock: Clock) -> FileRegistry {
        FileRegistry::new(
            "events",
            3,
            0,
            root,
            ".log",
            Arc::new(DelimitedCodec::new(b'\n', Some(b'\n'), false)),
            clock,
        )
    }

    #[test]
    fn test_first_write_creates_file() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path().to_str().unwrap(), Clock::fixed(1_000));

        let partitions = vec!["dt=2014-05-13".to_string()];
        registry
            .append(&partitions, &KeyValue::new(100, &b"payload"[..]), &[])
            .unwrap();

        assert_eq!(registry.len(), 1);
        let entry = registry.entries().next().unwrap();
        assert_eq!(entry.first_offset, 100);
        assert_eq!(entry.last_offset, 100);
        assert_eq!(entry.record_count, 1);
        assert_eq!(entry.created_at_ms, 1_000);
        assert!(entry.local_path.ends_with(
            "events/dt=2014-05-13/0_3_00000000000000000100.log"
        ));
        assert!(entry.local_path.exists());
    }

    #[test]
    fn test_appends_reuse_entry_and_track_offsets() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(1_000);
        let mut registry = registry(dir.path().to_str().unwrap(), clock.clone());

        let partitions = vec!["dt=2014-05-13".to_string()];
        registry
            .append(&partitions, &KeyValue::new(100, &b"a"[..]), &[])
            .unwrap();
        clock.set_millis(2_000);
        registry
            .append(&partitions, &KeyValue::new(101, &b"b"[..]), &[])
            .unwrap();

        assert_eq!(registry.len(), 1);
        let entry = registry.entries().next().unwrap();
        assert_eq!(entry.first_offset, 100);
        assert_eq!(entry.last_offset, 101);
        assert_eq!(entry.record_count, 2);
        assert_eq!(entry.created_at_ms, 1_000);
        assert_eq!(entry.last_write_at_ms, 2_000);
    }

    #[test]
    fn test_distinct_partitions_get_distinct_files() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path().to_str().unwrap(), Clock::fixed(0));

        registry
            .append(&["dt=2014-05-13".to_string()], &KeyValue::new(100, &b"a"[..]), &[])
            .unwrap();
        registry
            .append(&["dt=2014-05-14".to_string()], &KeyValue::new(101, &b"b"[..]), &[])
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.max_last_offset(), Some(101));
    }

    #[test]
    fn test_seal_blocks_appends() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path().to_str().unwrap(), Clock::fixed(0));

        let partitions = vec!["dt=2014-05-13".to_string()];
        registry
            .append(&partitions, &KeyValue::new(100, &b"a"[..]), &[])
            .unwrap();
        registry.seal_all().unwrap();

        let err = registry
            .append(&partitions, &KeyValue::new(101, &b"b"[..]), &[])
            .unwrap_err();
        assert!(matches!(err, ShipperError::Invariant(_)));
    }

    #[test]
    fn test_sealed_bytes_match_disk() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path().to_str().unwrap(), Clock::fixed(0));

        let partitions = vec!["dt=2014-05-13".to_string()];
        for offset in 0..10u64 {
            registry
                .append(&partitions, &KeyValue::new(offset, &b"0123456789"[..]), &[])
                .unwrap();
        }
        registry.seal_all().unwrap();

        let entry = registry.entries().next().unwrap();
        let on_disk = std::fs::metadata(&entry.local_path).unwrap().len();
        assert_eq!(entry.bytes_written, on_disk);
        assert_eq!(on_disk, 110); // 10 records * (10 bytes + newline)
    }

    #[test]
    fn test_drop_all_removes_files() {
        let dir = tempdir().unwrap();
        let mut registry = registry(dir.path().to_str().unwrap(), Clock::fixed(0));

        let partitions = vec!["dt=2014-05-13".to_string()];
        registry
            .append(&partitions, &KeyValue::new(100, &b"a"[..]), &[])
            .unwrap();
        let local_path = registry.entries().next().unwrap().local_path.clone();
        registry.seal_all().unwrap();
        registry.drop_all().unwrap();

        assert!(registry.is_empty());
        assert!(!local_path.exists());
    }

    #[test]
    fn test_aggregates_for_policy() {
        let dir = tempdir().unwrap();
        let clock = Clock::fixed(1_000);
        let mut registry = registry(dir.path().to_str().unwrap(), clock.clone());

        registry
            .append(&["dt=a".to_string()], &KeyValue::new(0, &b"x"[..]), &[])
            .unwrap();
        clock.set_millis(5_000);
        registry
            .append(&["dt=b".to_string()], &KeyValue::new(1, &b"longer-record"[..]), &[])
            .unwrap();

        assert_eq!(registry.min_created_at_ms(), Some(1_000));
        assert_eq!(registry.max_last_write_at_ms(), Some(5_000));
        assert_eq!(registry.max_record_count(), 1);
        assert_eq!(registry.max_bytes_written(), 14); // record + newline
    }
}
