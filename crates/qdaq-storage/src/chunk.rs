//! CSV chunk file format.
//!
//! UTF-8, LF-terminated rows, no quoting (no field may contain commas,
//! quotes or newlines). Header row: `timestamp,sensor_id,mode,value,TempC,Vin`.
//! Timestamps are RFC 3339 with an explicit UTC offset, full subsecond
//! precision preserved; optional fields serialize as empty strings when
//! absent.
//! Serialization is the exact inverse of parsing: reading a chunk back and
//! re-serializing it yields byte-identical output.

use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use qdaq_core::{QdaqError, Reading, Result, SensorMode};

/// Header row, without its terminator.
pub const HEADER: &str = "timestamp,sensor_id,mode,value,TempC,Vin";

/// Final name of chunk `index`.
pub fn chunk_file_name(index: u32) -> String {
    format!("chunk_{index:05}.csv")
}

/// Temporary name a chunk is written under until it is finalized.
pub fn tmp_file_name(index: u32) -> String {
    format!("chunk_{index:05}.csv.tmp")
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

fn opt_field(v: Option<f64>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

/// Serialize one reading as a row, LF terminator included.
pub fn format_row(r: &Reading) -> String {
    format!(
        "{},{},{},{},{},{}\n",
        format_ts(r.timestamp),
        r.sensor_id,
        r.mode,
        r.value,
        opt_field(r.temp_c),
        opt_field(r.vin),
    )
}

fn bad_row(line: &str, why: &str) -> QdaqError {
    QdaqError::StorageIo(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("malformed chunk row ({why}): {line:?}"),
    ))
}

fn parse_f64(field: &str, line: &str) -> Result<f64> {
    field.parse().map_err(|_| bad_row(line, "numeric field"))
}

fn parse_opt_f64(field: &str, line: &str) -> Result<Option<f64>> {
    if field.is_empty() {
        Ok(None)
    } else {
        parse_f64(field, line).map(Some)
    }
}

/// Parse one data row (terminator already stripped).
pub fn parse_row(line: &str) -> Result<Reading> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 6 {
        return Err(bad_row(line, "field count"));
    }
    let timestamp = DateTime::parse_from_rfc3339(fields[0])
        .map_err(|_| bad_row(line, "timestamp"))?
        .with_timezone(&Utc);
    let mode: SensorMode = fields[2]
        .parse()
        .map_err(|_| bad_row(line, "mode"))?;
    Ok(Reading {
        timestamp,
        sensor_id: fields[1].to_string(),
        mode,
        value: parse_f64(fields[3], line)?,
        temp_c: parse_opt_f64(fields[4], line)?,
        vin: parse_opt_f64(fields[5], line)?,
    })
}

/// Read a finalized chunk file back into readings.
pub fn read_chunk(path: &Path) -> Result<Vec<Reading>> {
    let text = fs::read_to_string(path).map_err(QdaqError::StorageIo)?;
    let mut lines = text.lines();
    match lines.next() {
        Some(header) if header == HEADER => {}
        other => {
            return Err(bad_row(other.unwrap_or(""), "header"));
        }
    }
    lines.map(parse_row).collect()
}
