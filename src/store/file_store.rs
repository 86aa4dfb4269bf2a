use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{broadcast, Mutex},
};
use tracing::{debug, info, warn};

use crate::utils::clock::Clock;

use super::{
    entities::{JournalEntry, NewPracticeRecord, PracticeRecordEntity, RecordId, RecordUpdate},
    error::StoreError,
    AggregateRow, ChangeOrigin, RecordQuery, RecordStore, RemoteChange, StoreChange, SumField,
};

pub const JOURNAL_FILE_NAME: &str = "records.jsonl";

/// Dead journal entries tolerated before the journal is rewritten on open.
const COMPACTION_SLACK: usize = 64;

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// The main realization of [RecordStore]. Records live in memory and every mutation is
/// appended to a journal file before it becomes visible.
pub struct FileRecordStore {
    journal_path: PathBuf,
    records: Mutex<BTreeMap<RecordId, PracticeRecordEntity>>,
    changes: broadcast::Sender<StoreChange>,
    clock: Box<dyn Clock>,
}

impl FileRecordStore {
    /// Opens the store in `dir`, replaying (and if needed compacting) the journal.
    pub async fn open(dir: PathBuf, clock: Box<dyn Clock>) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&dir).await?;
        let journal_path = dir.join(JOURNAL_FILE_NAME);

        let JournalContents { entries, corrupted } = read_journal_contents(&journal_path).await?;
        let entry_count = entries.len();
        let mut records = BTreeMap::new();
        for entry in entries {
            match entry {
                JournalEntry::Put { record } => {
                    records.insert(record.id, record);
                }
                JournalEntry::Delete { id } => {
                    records.remove(&id);
                }
            }
        }

        // A torn line has to go, otherwise the next append would be glued to it.
        if corrupted > 0 || entry_count > records.len() * 2 + COMPACTION_SLACK {
            compact(&journal_path, records.values()).await?;
            info!(
                "Compacted journal {journal_path:?} from {} to {} entries",
                entry_count + corrupted,
                records.len()
            );
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self {
            journal_path,
            records: Mutex::new(records),
            changes,
            clock,
        })
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    async fn append(&self, entries: &[JournalEntry]) -> Result<(), StoreError> {
        let mut buffer = Vec::<u8>::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }

        let mut file = File::options()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await?;

        // Semi-safe acquire-release for a file
        file.lock_exclusive()?;
        let result = async {
            file.write_all(&buffer).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        file.unlock_async().await?;
        result?;
        Ok(())
    }

    fn notify(&self, origin: ChangeOrigin, records: Vec<RecordId>) {
        let change = StoreChange { origin, records };
        debug!("Broadcasting {change:?}");
        if self.changes.send(change).is_err() {
            debug!("No subscribers for store changes");
        }
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn add(&self, record: NewPracticeRecord) -> Result<RecordId, StoreError> {
        let mut records = self.records.lock().await;
        let id = RecordId::generate();
        let record = record.into_entity(id);

        self.append(&[JournalEntry::Put {
            record: record.clone(),
        }])
        .await?;
        records.insert(id, record);
        drop(records);

        self.notify(ChangeOrigin::Local, vec![id]);
        Ok(id)
    }

    async fn delete(&self, ids: Vec<RecordId>) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if let Some(missing) = ids.iter().find(|id| !records.contains_key(id)) {
            return Err(StoreError::NotFound(*missing));
        }

        let entries = ids
            .iter()
            .map(|&id| JournalEntry::Delete { id })
            .collect::<Vec<_>>();
        self.append(&entries).await?;
        for id in &ids {
            records.remove(id);
        }
        drop(records);

        self.notify(ChangeOrigin::Local, ids);
        Ok(())
    }

    async fn update(&self, id: RecordId, update: RecordUpdate) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let mut record = records.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        update.apply_to(&mut record);

        self.append(&[JournalEntry::Put {
            record: record.clone(),
        }])
        .await?;
        records.insert(id, record);
        drop(records);

        self.notify(ChangeOrigin::Local, vec![id]);
        Ok(())
    }

    async fn query(&self, query: RecordQuery) -> Result<Vec<PracticeRecordEntity>, StoreError> {
        let now = self.clock.time();
        let records = self.records.lock().await;
        let mut matching = records
            .values()
            .filter(|record| query.matches(record, now))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by_key(|record| (record.effective_timestamp(now), record.id));
        Ok(matching)
    }

    async fn aggregate_sum(
        &self,
        field: SumField,
        query: RecordQuery,
    ) -> Result<AggregateRow, StoreError> {
        let now = self.clock.time();
        let records = self.records.lock().await;
        let sum = records
            .values()
            .filter(|record| query.matches(record, now))
            .map(|record| match field {
                SumField::DurationMinutes => *record.duration_minutes,
            })
            .sum::<f64>();
        debug!("Sum of {} over {query:?} is {sum}", field.name());
        Ok(AggregateRow::sum(sum))
    }

    async fn merge_remote(&self, changes: Vec<RemoteChange>) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;

        // Changes are applied in order, so a batch may create and then delete the same record.
        let mut staged = records.clone();
        let mut entries = Vec::with_capacity(changes.len());
        let mut affected = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                RemoteChange::Upsert(record) => {
                    let record = record.with_whole_seconds();
                    if staged.get(&record.id) == Some(&record) {
                        continue;
                    }
                    affected.push(record.id);
                    staged.insert(record.id, record.clone());
                    entries.push(JournalEntry::Put { record });
                }
                RemoteChange::Delete(id) => {
                    if staged.remove(&id).is_none() {
                        continue;
                    }
                    affected.push(id);
                    entries.push(JournalEntry::Delete { id });
                }
            }
        }

        if entries.is_empty() {
            debug!("Remote merge brought no changes");
            return Ok(());
        }

        self.append(&entries).await?;
        *records = staged;
        drop(records);

        affected.sort();
        affected.dedup();
        info!("Merged {} remote changes", entries.len());
        self.notify(ChangeOrigin::Remote, affected);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

struct JournalContents {
    entries: Vec<JournalEntry>,
    corrupted: usize,
}

/// Reads every valid journal entry of `path`. A missing journal is an empty one.
pub async fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, StoreError> {
    Ok(read_journal_contents(path).await?.entries)
}

async fn read_journal_contents(path: &Path) -> Result<JournalContents, StoreError> {
    async fn extract(path: &Path) -> Result<JournalContents, std::io::Error> {
        debug!("Extracting {path:?}");
        let file = File::open(path).await?;
        file.lock_shared()?;
        let buffer = BufReader::new(file);
        let mut lines = buffer.lines();
        let mut entries = vec![];
        let mut corrupted = 0;
        while let Ok(Some(v)) = lines.next_line().await {
            if v.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&v) {
                Ok(v) => entries.push(v),
                Err(e) => {
                    // ignore illegal values. Might happen after a write was cut by shutdown
                    warn!(
                        "During parsing in path {:?} found illegal json string {}:  {e}",
                        path, &v
                    );
                    corrupted += 1;
                }
            }
        }

        lines.into_inner().into_inner().unlock_async().await?;

        Ok(JournalContents { entries, corrupted })
    }

    match extract(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(JournalContents {
            entries: vec![],
            corrupted: 0,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Converts another device's journal into the changes it describes, in journal order.
pub async fn read_remote_changes(path: &Path) -> Result<Vec<RemoteChange>, StoreError> {
    Ok(read_journal(path)
        .await?
        .into_iter()
        .map(|entry| match entry {
            JournalEntry::Put { record } => RemoteChange::Upsert(record),
            JournalEntry::Delete { id } => RemoteChange::Delete(id),
        })
        .collect())
}

/// Rewrites the journal so it only holds the live records.
async fn compact<'a>(
    path: &Path,
    records: impl Iterator<Item = &'a PracticeRecordEntity>,
) -> Result<(), StoreError> {
    let mut buffer = Vec::<u8>::new();
    for record in records {
        serde_json::to_writer(
            &mut buffer,
            &JournalEntry::Put {
                record: record.clone(),
            },
        )?;
        buffer.push(b'\n');
    }

    let temporary = path.with_extension("jsonl.tmp");
    let mut file = File::create(&temporary).await?;
    file.write_all(&buffer).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temporary, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;
    use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::{
        store::{
            entities::{
                DeviceId, DurationMinutes, JournalEntry, NewPracticeRecord, PracticeRecordEntity,
                RecordId, RecordUpdate,
            },
            error::StoreError,
            AggregateRow, ChangeOrigin, RecordQuery, RecordStore, RemoteChange, SumField,
        },
        utils::{clock::test_clock::TestClock, logging::TEST_LOGGING},
    };

    use super::{read_journal, read_remote_changes, FileRecordStore, JOURNAL_FILE_NAME};

    const TEST_START_DATE: NaiveDateTime = NaiveDateTime::new(
        NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(),
        NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
    );

    fn new_record(offset: Duration, minutes: f64) -> NewPracticeRecord {
        NewPracticeRecord {
            timestamp: Utc.from_utc_datetime(&TEST_START_DATE) + offset,
            duration_minutes: DurationMinutes::new_opt(minutes).unwrap(),
            creator_id: Some(DeviceId::from("device a")),
        }
    }

    fn clock() -> Box<TestClock> {
        Box::new(TestClock::new(Utc.from_utc_datetime(&TEST_START_DATE)))
    }

    #[tokio::test]
    async fn test_records_survive_reopen() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let first = store.add(new_record(Duration::hours(1), 5.)).await?;
        let second = store.add(new_record(-Duration::hours(1), 10.)).await?;
        store
            .update(
                first,
                RecordUpdate::duration(DurationMinutes::new_opt(20.).unwrap()),
            )
            .await?;
        drop(store);

        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let records = store.query(RecordQuery::all()).await?;

        assert_eq!(
            records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![second, first]
        );
        assert_eq!(*records[1].duration_minutes, 20.);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_window_and_aggregate() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        store.add(new_record(-Duration::days(2), 7.)).await?;
        store.add(new_record(Duration::zero(), 5.)).await?;
        store.add(new_record(Duration::days(2), 22.)).await?;

        let start = Utc.from_utc_datetime(&TEST_START_DATE) - Duration::days(1);
        let query = RecordQuery::between(start, start + Duration::days(2));

        let records = store.query(query).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(*records[0].duration_minutes, 5.);

        let row = store.aggregate_sum(SumField::DurationMinutes, query).await?;
        assert_eq!(row.decode_f64(AggregateRow::SUM)?, 5.);

        let row = store
            .aggregate_sum(SumField::DurationMinutes, RecordQuery::all())
            .await?;
        assert_eq!(row.decode_f64(AggregateRow::SUM)?, 34.);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_all_or_nothing() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let id = store.add(new_record(Duration::zero(), 5.)).await?;
        let unknown = RecordId::generate();

        let result = store.delete(vec![id, unknown]).await;
        assert!(matches!(result, Err(StoreError::NotFound(missing)) if missing == unknown));
        assert_eq!(store.query(RecordQuery::all()).await?.len(), 1);

        store.delete(vec![id]).await?;
        assert!(store.query(RecordQuery::all()).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let result = store
            .update(RecordId::generate(), RecordUpdate::default())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_every_mutation_is_broadcast() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let mut changes = store.subscribe();

        let id = store.add(new_record(Duration::zero(), 5.)).await?;
        let change = changes.recv().await?;
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(change.records, vec![id]);

        let remote = PracticeRecordEntity {
            id: RecordId::generate(),
            timestamp: Some(Utc.from_utc_datetime(&TEST_START_DATE)),
            duration_minutes: DurationMinutes::new_opt(30.).unwrap(),
            creator_id: Some(DeviceId::from("device b")),
        };
        store
            .merge_remote(vec![RemoteChange::Upsert(remote.clone()), RemoteChange::Delete(id)])
            .await?;
        let change = changes.recv().await?;
        assert_eq!(change.origin, ChangeOrigin::Remote);
        let mut expected = vec![remote.id, id];
        expected.sort();
        assert_eq!(change.records, expected);

        assert_eq!(store.query(RecordQuery::all()).await?, vec![remote.clone()]);

        // Replaying the same state is not a change.
        store
            .merge_remote(vec![RemoteChange::Upsert(remote)])
            .await?;
        assert!(changes.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_tail_is_ignored() -> Result<()> {
        let dir = tempdir()?;
        let record = PracticeRecordEntity {
            id: RecordId::generate(),
            timestamp: Some(Utc.from_utc_datetime(&TEST_START_DATE)),
            duration_minutes: DurationMinutes::DEFAULT,
            creator_id: None,
        };
        let mut file = std::fs::File::create(dir.path().join(JOURNAL_FILE_NAME))?;
        serde_json::to_writer(&mut file, &JournalEntry::Put { record: record.clone() })?;
        file.write_all(b"\n{\"op\":\"put\",\"rec")?;
        drop(file);

        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        assert_eq!(store.query(RecordQuery::all()).await?, vec![record.clone()]);

        // The torn line is gone, so new entries stay readable.
        let id = store.add(new_record(Duration::zero(), 5.)).await?;
        drop(store);
        let entries = read_journal(&dir.path().join(JOURNAL_FILE_NAME)).await?;
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[1], JournalEntry::Put { record } if record.id == id));
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_is_compacted_on_open() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let kept = store.add(new_record(Duration::zero(), 5.)).await?;
        for _ in 0..40 {
            let id = store.add(new_record(Duration::zero(), 1.)).await?;
            store.delete(vec![id]).await?;
        }
        drop(store);

        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let entries = read_journal(store.journal_path()).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(store.query(RecordQuery::all()).await?[0].id, kept);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_changes_from_other_journal() -> Result<()> {
        let other = tempdir()?;
        let other_store = FileRecordStore::open(other.path().to_owned(), clock()).await?;
        let id = other_store.add(new_record(Duration::zero(), 5.)).await?;
        other_store.delete(vec![id]).await?;
        let kept = other_store.add(new_record(Duration::zero(), 10.)).await?;

        let changes = read_remote_changes(other_store.journal_path()).await?;
        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[1], RemoteChange::Delete(deleted) if deleted == id));

        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        store.merge_remote(changes).await?;
        let records = store.query(RecordQuery::all()).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, kept);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_change_reports_each_record_once() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let mut changes = store.subscribe();
        let first = PracticeRecordEntity {
            id: RecordId::generate(),
            timestamp: Some(Utc.from_utc_datetime(&TEST_START_DATE)),
            duration_minutes: DurationMinutes::DEFAULT,
            creator_id: Some(DeviceId::from("device b")),
        };
        let second = PracticeRecordEntity {
            id: RecordId::generate(),
            ..first.clone()
        };

        store
            .merge_remote(vec![
                RemoteChange::Upsert(first.clone()),
                RemoteChange::Upsert(second.clone()),
                RemoteChange::Delete(first.id),
            ])
            .await?;
        let change = changes.recv().await?;
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(change.records, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_fractional_seconds_match_the_journal() -> Result<()> {
        let dir = tempdir()?;
        let store = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        let whole = Utc.from_utc_datetime(&TEST_START_DATE);
        let remote = PracticeRecordEntity {
            id: RecordId::generate(),
            timestamp: Some(whole + Duration::milliseconds(500)),
            duration_minutes: DurationMinutes::DEFAULT,
            creator_id: Some(DeviceId::from("device b")),
        };
        store
            .merge_remote(vec![RemoteChange::Upsert(remote.clone())])
            .await?;
        let id = store
            .add(NewPracticeRecord {
                timestamp: whole + Duration::milliseconds(1500),
                ..new_record(Duration::zero(), 5.)
            })
            .await?;
        store
            .update(
                id,
                RecordUpdate {
                    timestamp: Some(whole + Duration::milliseconds(2700)),
                    duration_minutes: None,
                },
            )
            .await?;

        let in_memory = store.query(RecordQuery::all()).await?;
        assert_eq!(in_memory[0].timestamp, Some(whole));
        assert_eq!(in_memory[1].timestamp, Some(whole + Duration::seconds(2)));
        drop(store);

        let reopened = FileRecordStore::open(dir.path().to_owned(), clock()).await?;
        assert_eq!(reopened.query(RecordQuery::all()).await?, in_memory);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_journal_is_empty() -> Result<()> {
        let dir = tempdir()?;
        assert!(read_journal(&dir.path().join("nothing.jsonl")).await?.is_empty());
        Ok(())
    }
}
