use std::{io, path::Path, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::model::UsageInterval;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("usage store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode usage interval: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("usage store did not answer within {0:?}")]
    Timeout(Duration),
}

/// Durable destination for finalized usage intervals.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage_interval(&self, interval: &UsageInterval) -> Result<(), SinkError>;
}

/// Appends one JSON object per interval to a file.
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl UsageSink for JsonLinesSink {
    async fn record_usage_interval(&self, interval: &UsageInterval) -> Result<(), SinkError> {
        let line = json!({
            "id": interval.idempotency_key(),
            "hwaddr": interval.hwaddr,
            "start": interval.start,
            "stop": interval.stop,
            "ingress": interval.ingress,
            "egress": interval.egress,
        });
        let mut buf = serde_json::to_vec(&line)?;
        buf.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HwAddr;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    #[tokio::test]
    async fn appends_one_line_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        let sink = JsonLinesSink::open(&path).await.unwrap();

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let stop = Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap();
        for key in [1u64, 2] {
            let interval = UsageInterval {
                hwaddr: HwAddr::from_key(key),
                start,
                stop,
                ingress: 1000 * key,
                egress: 10 * key,
            };
            sink.record_usage_interval(&interval).await.unwrap();
        }
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["hwaddr"], "00:00:00:00:00:02");
        assert_eq!(lines[1]["ingress"], 2000);
        assert_eq!(lines[1]["egress"], 20);
        assert!(
            lines[0]["id"]
                .as_str()
                .unwrap()
                .starts_with("00:00:00:00:00:01@")
        );
    }

    #[tokio::test]
    async fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        let interval = UsageInterval {
            hwaddr: HwAddr::from_key(9),
            start: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            stop: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap(),
            ingress: 1,
            egress: 1,
        };
        for _ in 0..2 {
            let sink = JsonLinesSink::open(&path).await.unwrap();
            sink.record_usage_interval(&interval).await.unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
