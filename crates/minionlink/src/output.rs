use std::io::IsTerminal;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use minionlink_frame::Value;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One line of command output.
#[derive(Serialize)]
pub struct Record<'a> {
    pub kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered: Option<usize>,
    pub timestamp: String,
}

impl<'a> Record<'a> {
    pub fn new(kind: &'a str) -> Self {
        Self {
            kind,
            endpoint: None,
            payload: None,
            elapsed_ms: None,
            delivered: None,
            timestamp: now_unix_seconds(),
        }
    }

    pub fn endpoint(mut self, endpoint: &'a str) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn payload(mut self, payload: &Value) -> Self {
        self.payload = Some(payload.to_json());
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn delivered(mut self, delivered: usize) -> Self {
        self.delivered = Some(delivered);
        self
    }

    fn columns(&self) -> Vec<(&'static str, String)> {
        let mut columns = vec![("KIND", self.kind.to_string())];
        if let Some(endpoint) = self.endpoint {
            columns.push(("ENDPOINT", endpoint.to_string()));
        }
        if let Some(payload) = &self.payload {
            columns.push(("PAYLOAD", payload.to_string()));
        }
        if let Some(ms) = self.elapsed_ms {
            columns.push(("ELAPSED", format!("{ms}ms")));
        }
        if let Some(delivered) = self.delivered {
            columns.push(("DELIVERED", delivered.to_string()));
        }
        columns
    }
}

pub fn print_record(record: &Record<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (header, row): (Vec<_>, Vec<_>) = record.columns().into_iter().unzip();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(header)
                .add_row(row);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line: Vec<String> = record
                .columns()
                .into_iter()
                .map(|(name, value)| format!("{}={value}", name.to_lowercase()))
                .collect();
            println!("{}", line.join(" "));
        }
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_record_skips_absent_fields() {
        let record = Record::new("reply")
            .payload(&Value::map([("result", "pong")]))
            .elapsed(Duration::from_millis(12));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "reply");
        assert_eq!(json["payload"]["result"], "pong");
        assert_eq!(json["elapsed_ms"], 12);
        assert!(json.get("delivered").is_none());
        assert!(json.get("endpoint").is_none());
    }

    #[test]
    fn columns_follow_present_fields() {
        let record = Record::new("published").delivered(3);
        let names: Vec<&str> = record.columns().iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["KIND", "DELIVERED"]);
    }
}
