//! Append-only CSV log of readings.

use std::fs::File;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::error::{Error, Result};
use crate::reading::Reading;

pub const FULL_HEADER: [&str; 7] = [
    "Timestamp",
    "Input_Voltage(V)",
    "Input_Current(A)",
    "Input_Power(W)",
    "Output_Voltage(V)",
    "Output_Current(A)",
    "Output_Power(W)",
];

pub const METER_ONLY_HEADER: [&str; 4] = ["Timestamp", "Voltage(V)", "Current(A)", "Power(W)"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CsvLayout {
    /// Source (input) and meter (output) columns.
    #[default]
    Full,
    /// Meter columns only.
    MeterOnly,
}

impl CsvLayout {
    pub fn header(self) -> &'static [&'static str] {
        match self {
            CsvLayout::Full => &FULL_HEADER,
            CsvLayout::MeterOnly => &METER_ONLY_HEADER,
        }
    }

    fn record(self, reading: &Reading) -> Vec<String> {
        let mut record = vec![reading.timestamp_label()];
        let values = match self {
            CsvLayout::Full => vec![
                reading.input_voltage,
                reading.input_current,
                reading.input_power,
                reading.output_voltage,
                reading.output_current,
                reading.output_power,
            ],
            CsvLayout::MeterOnly => vec![
                reading.output_voltage,
                reading.output_current,
                reading.output_power,
            ],
        };
        record.extend(values.iter().map(|v| format!("{v:?}")));
        record
    }
}

/// The session's CSV file. The header is written on creation and never again.
pub struct CsvLog {
    path: PathBuf,
    layout: CsvLayout,
    writer: csv::Writer<File>,
    rows: u64,
}

impl CsvLog {
    pub fn create(path: &Path, layout: CsvLayout) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::Csv(e.into()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(layout.header())?;
        writer.flush().map_err(|e| Error::Csv(e.into()))?;
        Ok(CsvLog {
            path: path.to_path_buf(),
            layout,
            writer,
            rows: 0,
        })
    }

    /// Append one row and push it to disk.
    pub fn append(&mut self, reading: &Reading) -> Result<()> {
        self.writer.write_record(self.layout.record(reading))?;
        self.writer.flush().map_err(|e| Error::Csv(e.into()))?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| Error::Csv(e.into()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Measurement;
    use chrono::{Local, TimeZone};

    fn reading() -> Reading {
        let at = Local.with_ymd_and_hms(2025, 12, 15, 14, 25, 55).unwrap();
        Reading::new(
            at,
            Measurement::new(12.01, 2.0, 24.02),
            Measurement::new(120.045, -1.002, -120.28),
        )
    }

    #[test]
    fn full_layout_writes_header_once_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");

        let mut log = CsvLog::create(&path, CsvLayout::Full).unwrap();
        log.append(&reading()).unwrap();
        log.append(&reading()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], FULL_HEADER.join(","));
        assert_eq!(
            lines[1],
            "2025-12-15 14:25:55,12.01,2.0,24.02,120.045,1.002,120.28"
        );
        assert_eq!(log.rows(), 2);
    }

    #[test]
    fn meter_only_layout_keeps_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");

        let mut log = CsvLog::create(&path, CsvLayout::MeterOnly).unwrap();
        log.append(&reading()).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = rdr.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, METER_ONLY_HEADER);
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), header.len());
        assert_eq!(&rows[0][1], "120.045");
    }
}
