//! The header-encoded retry counter.
//!
//! The counter lives in a single message header and crosses client-library
//! boundaries, so it is read tolerantly from any AMQP integer representation
//! and always written back in one canonical encoding.
use amq_protocol_types::{AMQPValue, FieldTable, ShortString};

/// Header key holding the number of times a message has been requeued.
/// Absent on first delivery.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Read the retry counter from a delivery's headers.
///
/// A missing header, a missing table or a non-integer value all count as a
/// first delivery.
pub fn read_retry_count(headers: Option<&FieldTable>) -> i64 {
    let key = ShortString::from(RETRY_COUNT_HEADER);
    let Some(value) = headers.and_then(|table| table.inner().get(&key)) else {
        return 0;
    };
    match value {
        AMQPValue::LongLongInt(count) => *count,
        AMQPValue::LongInt(count) => i64::from(*count),
        AMQPValue::LongUInt(count) => i64::from(*count),
        AMQPValue::ShortInt(count) => i64::from(*count),
        AMQPValue::ShortUInt(count) => i64::from(*count),
        AMQPValue::ShortShortInt(count) => i64::from(*count),
        AMQPValue::ShortShortUInt(count) => i64::from(*count),
        _ => 0,
    }
}

/// Build the header table for a republished message: every original header
/// is preserved and the retry counter is bumped to `retry_count + 1`, in the
/// canonical `LongLongInt` encoding.
pub fn incremented_headers(headers: Option<&FieldTable>, retry_count: i64) -> FieldTable {
    let mut headers = headers.cloned().unwrap_or_default();
    headers.insert(
        RETRY_COUNT_HEADER.into(),
        AMQPValue::LongLongInt(retry_count + 1),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_protocol_types::LongString;

    #[test]
    fn absent_headers_mean_first_delivery() {
        assert_eq!(read_retry_count(None), 0);
        assert_eq!(read_retry_count(Some(&FieldTable::default())), 0);
    }

    #[test]
    fn every_integer_representation_is_accepted() {
        let representations = [
            AMQPValue::LongLongInt(4),
            AMQPValue::LongInt(4),
            AMQPValue::LongUInt(4),
            AMQPValue::ShortInt(4),
            AMQPValue::ShortUInt(4),
            AMQPValue::ShortShortInt(4),
            AMQPValue::ShortShortUInt(4),
        ];
        for value in representations {
            let mut table = FieldTable::default();
            table.insert(RETRY_COUNT_HEADER.into(), value.clone());
            assert_eq!(read_retry_count(Some(&table)), 4, "for {value:?}");
        }
    }

    #[test]
    fn non_integer_values_fall_back_to_zero() {
        let mut table = FieldTable::default();
        table.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongString(LongString::from("4")),
        );
        assert_eq!(read_retry_count(Some(&table)), 0);
    }

    #[test]
    fn increment_preserves_unrelated_headers() {
        let mut original = FieldTable::default();
        original.insert("x-origin".into(), AMQPValue::LongString("billing".into()));
        original.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(2));

        let bumped = incremented_headers(Some(&original), read_retry_count(Some(&original)));

        assert_eq!(
            bumped.inner().get(&ShortString::from(RETRY_COUNT_HEADER)),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(
            bumped.inner().get(&ShortString::from("x-origin")),
            Some(&AMQPValue::LongString("billing".into()))
        );
    }

    #[test]
    fn increment_without_headers_starts_at_one() {
        let bumped = incremented_headers(None, 0);
        assert_eq!(
            bumped.inner().get(&ShortString::from(RETRY_COUNT_HEADER)),
            Some(&AMQPValue::LongLongInt(1))
        );
    }
}
