use anyhow::Result;

use crate::db::{
    helpers::{read_json, write_json},
    models::{EventList, EventRecord},
    Database,
};

/// Both buffered lists, read in one storage task.
#[derive(Debug, Clone, Default)]
pub struct BufferedEvents {
    pub survey: Vec<EventRecord>,
    pub raw: Vec<EventRecord>,
}

impl BufferedEvents {
    pub fn total(&self) -> usize {
        self.survey.len() + self.raw.len()
    }
}

impl Database {
    /// Read-modify-write append. Returns the combined length of both lists
    /// after the append.
    pub async fn append_event(&self, list: EventList, record: EventRecord) -> Result<usize> {
        self.execute(move |conn| {
            let mut entries =
                read_json::<Vec<EventRecord>>(conn, list.key())?.unwrap_or_default();
            entries.push(record);
            write_json(conn, list.key(), &entries)?;

            let other = match list {
                EventList::Raw => EventList::Survey,
                EventList::Survey => EventList::Raw,
            };
            let other_len = read_json::<Vec<EventRecord>>(conn, other.key())?
                .map(|v| v.len())
                .unwrap_or(0);
            Ok(entries.len() + other_len)
        })
        .await
    }

    pub async fn buffered_events(&self) -> Result<BufferedEvents> {
        self.execute(|conn| {
            Ok(BufferedEvents {
                survey: read_json(conn, EventList::Survey.key())?.unwrap_or_default(),
                raw: read_json(conn, EventList::Raw.key())?.unwrap_or_default(),
            })
        })
        .await
    }

    /// `(raw, survey)` lengths.
    pub async fn buffered_counts(&self) -> Result<(usize, usize)> {
        let events = self.buffered_events().await?;
        Ok((events.raw.len(), events.survey.len()))
    }

    /// Drops `survey_count` and `raw_count` entries from the front of the
    /// lists as they are stored right now. Entries appended after an upload
    /// started are never touched.
    pub async fn remove_uploaded(&self, survey_count: usize, raw_count: usize) -> Result<()> {
        self.execute(move |conn| {
            for (list, count) in [(EventList::Survey, survey_count), (EventList::Raw, raw_count)] {
                if count == 0 {
                    continue;
                }
                let entries =
                    read_json::<Vec<EventRecord>>(conn, list.key())?.unwrap_or_default();
                let remaining: Vec<EventRecord> = entries.into_iter().skip(count).collect();
                write_json(conn, list.key(), &remaining)?;
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use serde_json::json;

    fn record(n: u64) -> EventRecord {
        let mut map = EventRecord::new();
        map.insert("n".into(), json!(n));
        map
    }

    #[tokio::test]
    async fn append_reports_combined_total() {
        let (_dir, db) = temp_database();
        assert_eq!(db.append_event(EventList::Raw, record(1)).await.unwrap(), 1);
        assert_eq!(db.append_event(EventList::Survey, record(2)).await.unwrap(), 2);
        assert_eq!(db.append_event(EventList::Raw, record(3)).await.unwrap(), 3);
        assert_eq!(db.buffered_counts().await.unwrap(), (2, 1));
    }

    #[tokio::test]
    async fn remove_uploaded_slices_from_front() {
        let (_dir, db) = temp_database();
        for n in 0..5 {
            db.append_event(EventList::Raw, record(n)).await.unwrap();
        }
        db.append_event(EventList::Survey, record(100)).await.unwrap();

        db.remove_uploaded(1, 3).await.unwrap();

        let events = db.buffered_events().await.unwrap();
        assert!(events.survey.is_empty());
        let remaining: Vec<u64> = events
            .raw
            .iter()
            .map(|r| r["n"].as_u64().unwrap())
            .collect();
        assert_eq!(remaining, vec![3, 4]);
    }
}
