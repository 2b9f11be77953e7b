use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use time::UtcDateTime;

const NANOS_PER_MILLI: i128 = 1_000_000;

/// The three instants recorded for every entry, all in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub created: UtcDateTime,
    pub modified: UtcDateTime,
    /// Set once at import.
    pub imported: UtcDateTime,
}

/// A partial timestamp update. Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampUpdate {
    pub created: Option<UtcDateTime>,
    pub modified: Option<UtcDateTime>,
    pub imported: Option<UtcDateTime>,
}

impl TimestampUpdate {
    /// Fill the gaps from `existing`. Without an existing row every field has
    /// to be supplied.
    pub(crate) fn backfill(self, existing: Option<Timestamps>) -> Result<Timestamps> {
        let complete = match existing {
            Some(existing) => Timestamps {
                created: self.created.unwrap_or(existing.created),
                modified: self.modified.unwrap_or(existing.modified),
                imported: self.imported.unwrap_or(existing.imported),
            },
            None => Timestamps {
                created: self.created.ok_or_raise(|| ErrorKind::Validation("date_created is required"))?,
                modified: self.modified.ok_or_raise(|| ErrorKind::Validation("date_modified is required"))?,
                imported: self.imported.ok_or_raise(|| ErrorKind::Validation("date_imported is required"))?,
            },
        };
        Ok(complete)
    }
}

impl From<Timestamps> for TimestampUpdate {
    fn from(timestamps: Timestamps) -> Self {
        Self {
            created: Some(timestamps.created),
            modified: Some(timestamps.modified),
            imported: Some(timestamps.imported),
        }
    }
}

fn to_millis(instant: UtcDateTime) -> Result<i64> {
    i64::try_from(instant.unix_timestamp_nanos() / NANOS_PER_MILLI).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

/// The current instant, as stored.
pub(crate) fn now_millis() -> Result<i64> {
    to_millis(UtcDateTime::now())
}

fn from_millis(millis: i64) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(millis) * NANOS_PER_MILLI)
        .or_raise(|| ErrorKind::InvalidData("timestamp"))
}

#[derive(sqlx::FromRow)]
pub(crate) struct TimestampRow {
    pub(crate) date_created: i64,
    pub(crate) date_modified: i64,
    pub(crate) date_imported: i64,
}
impl TryFrom<&Timestamps> for TimestampRow {
    type Error = Error;
    fn try_from(timestamps: &Timestamps) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            date_created: to_millis(timestamps.created)?,
            date_modified: to_millis(timestamps.modified)?,
            date_imported: to_millis(timestamps.imported)?,
        })
    }
}
impl TryFrom<TimestampRow> for Timestamps {
    type Error = Error;
    fn try_from(row: TimestampRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            created: from_millis(row.date_created)?,
            modified: from_millis(row.date_modified)?,
            imported: from_millis(row.date_imported)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(seconds).unwrap()
    }

    #[test]
    fn test_row_round_trip_keeps_milliseconds() {
        let created = UtcDateTime::from_unix_timestamp_nanos(1_700_000_000_123_456_789).unwrap();
        let timestamps = Timestamps { created, modified: at(1), imported: at(2) };
        let row = TimestampRow::try_from(&timestamps).unwrap();
        assert_eq!(row.date_created, 1_700_000_000_123);
        let back = Timestamps::try_from(row).unwrap();
        // Sub-millisecond precision is not stored.
        assert_eq!(back.created, UtcDateTime::from_unix_timestamp_nanos(1_700_000_000_123_000_000).unwrap());
        assert_eq!(back.modified, at(1));
    }

    #[test]
    fn test_backfill_from_existing() {
        let existing = Timestamps { created: at(1), modified: at(2), imported: at(3) };
        let update = TimestampUpdate { modified: Some(at(20)), ..Default::default() };
        let merged = update.backfill(Some(existing)).unwrap();
        assert_eq!(merged, Timestamps { created: at(1), modified: at(20), imported: at(3) });
    }

    #[test]
    fn test_backfill_without_existing_requires_everything() {
        let update = TimestampUpdate { modified: Some(at(20)), ..Default::default() };
        let err = update.backfill(None).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
        let complete = TimestampUpdate::from(Timestamps { created: at(1), modified: at(2), imported: at(3) });
        assert!(complete.backfill(None).is_ok());
    }
}
