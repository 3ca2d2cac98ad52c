use crate::domain::event::EventRecord;
use crate::error::Result;
use chrono::SecondsFormat;
use serde::Serialize;
use std::io::Write;

/// Flat view of an event for the CSV audit trail.
#[derive(Debug, Serialize)]
struct AuditRow {
    event_id: String,
    lease_id: String,
    event_type: String,
    amount: String,
    timestamp: String,
    payload_json: String,
}

impl TryFrom<&EventRecord> for AuditRow {
    type Error = crate::error::LedgerError;

    fn try_from(record: &EventRecord) -> Result<Self> {
        Ok(Self {
            event_id: format!("{}:{}", record.aggregate_id, record.sequence_no),
            lease_id: record.aggregate_id.to_string(),
            event_type: record.event_type.clone(),
            amount: record.amount.map(|a| a.to_string()).unwrap_or_default(),
            timestamp: record.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            payload_json: serde_json::to_string(&record.payload)?,
        })
    }
}

/// Writes committed events as an audit trail.
pub struct AuditWriter<W: Write> {
    writer: W,
}

impl<W: Write> AuditWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Pretty-printed JSON array of event records.
    pub fn write_json(mut self, records: &[EventRecord]) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, records)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_csv(self, records: &[EventRecord]) -> Result<()> {
        let mut writer = csv::Writer::from_writer(self.writer);
        for record in records {
            writer.serialize(AuditRow::try_from(record)?)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lease::LeaseId;
    use crate::domain::money::Money;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn records() -> (LeaseId, Vec<EventRecord>) {
        let lease_id = LeaseId::new();
        let at = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let records = vec![
            EventRecord {
                aggregate_id: lease_id,
                sequence_no: 5,
                event_type: "PAYMENT_SUCCEEDED".to_string(),
                payload: json!({ "installment_number": 1 }),
                amount: Some(Money::new(dec!(100))),
                timestamp: at,
                origin_command_id: "ATTEMPT_PAYMENT/p-1".to_string(),
            },
            EventRecord {
                aggregate_id: lease_id,
                sequence_no: 6,
                event_type: "LEASE_ACTIVATED".to_string(),
                payload: serde_json::Value::Null,
                amount: None,
                timestamp: at,
                origin_command_id: "ATTEMPT_PAYMENT/p-1".to_string(),
            },
        ];
        (lease_id, records)
    }

    #[test]
    fn test_csv_audit_trail() {
        let (lease_id, records) = records();
        let mut out = Vec::new();
        AuditWriter::new(&mut out).write_csv(&records).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "event_id,lease_id,event_type,amount,timestamp,payload_json"
        );
        assert!(lines[1].starts_with(&format!(
            "{lease_id}:5,{lease_id},PAYMENT_SUCCEEDED,100.00,2025-01-31T00:00:00Z,"
        )));
        assert!(lines[1].contains("installment_number"));
        assert!(lines[2].contains("LEASE_ACTIVATED,,2025-01-31T00:00:00Z,null"));
    }

    #[test]
    fn test_json_audit_trail() {
        let (_, records) = records();
        let mut out = Vec::new();
        AuditWriter::new(&mut out).write_json(&records).unwrap();
        let parsed: Vec<EventRecord> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, records);
    }
}
