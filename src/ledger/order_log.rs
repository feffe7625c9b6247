use crate::models::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

pub const ORDER_LOG_HEADER: &str =
    "time,type,id,price,quantity,av_price,position,pnl,balance,drawdown";

/// One audit-trail line per ledger leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLogRecord {
    pub time: DateTime<Utc>,
    pub side: Side,
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    pub avg_price: f64,
    pub position: f64,
    /// None on opening legs
    pub pnl: Option<f64>,
    pub balance: f64,
    pub drawdown: f64,
}

impl OrderLogRecord {
    pub fn to_csv_row(&self) -> String {
        let pnl = self
            .pnl
            .map(|p| format!("{:.2}", p))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{},{},{},{},{},{},{},{},{:.2},{:.2}",
            self.time.to_rfc3339(),
            self.side,
            self.id,
            self.price,
            self.quantity,
            self.avg_price,
            self.position,
            pnl,
            self.balance,
            self.drawdown
        )
    }
}

/// Append-only fill log, optionally mirrored to a CSV file
#[derive(Default)]
pub struct OrderLog {
    sink: Option<BufWriter<File>>,
    records: Vec<OrderLogRecord>,
}

impl OrderLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Append to `path`, writing the header when the file is new
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let fresh = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut sink = BufWriter::new(file);
        if fresh {
            writeln!(sink, "{}", ORDER_LOG_HEADER)?;
        }
        Ok(Self {
            sink: Some(sink),
            records: Vec::new(),
        })
    }

    pub fn append(&mut self, record: OrderLogRecord) {
        if let Some(sink) = self.sink.as_mut() {
            let written = writeln!(sink, "{}", record.to_csv_row()).and_then(|_| sink.flush());
            if let Err(e) = written {
                tracing::warn!("Failed to write order log: {}", e);
            }
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[OrderLogRecord] {
        &self.records
    }
}
