use chrono::{DateTime, Local};

use crate::error::{Error, Result};

/// Timestamp layout used in the CSV log and status lines.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One voltage/current/power triple as reported by an instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl Measurement {
    pub fn new(voltage: f64, current: f64, power: f64) -> Self {
        Measurement {
            voltage,
            current,
            power,
        }
    }
}

/// Parse a comma separated `voltage,current,power` reply.
///
/// Empty fields are ignored; anything after the third field is ignored.
pub fn parse_reading(raw: &str) -> Result<Measurement> {
    let fields: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect();
    if fields.len() < 3 {
        return Err(Error::ReadParse {
            raw: raw.to_string(),
            reason: format!("expected 3 fields, got {}", fields.len()),
        });
    }

    let mut values = [0.0; 3];
    for (value, field) in values.iter_mut().zip(&fields) {
        let parsed = field.parse::<f64>().map_err(|e| Error::ReadParse {
            raw: raw.to_string(),
            reason: format!("{field:?}: {e}"),
        })?;
        if !parsed.is_finite() {
            return Err(Error::ReadParse {
                raw: raw.to_string(),
                reason: format!("{field:?} is not a finite value"),
            });
        }
        *value = parsed;
    }
    let [voltage, current, power] = values;
    Ok(Measurement::new(voltage, current, power))
}

/// One polling tick: DC source on the input side, power meter on the output side.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Local>,
    pub input_voltage: f64,
    pub input_current: f64,
    pub input_power: f64,
    pub output_voltage: f64,
    pub output_current: f64,
    pub output_power: f64,
}

impl Reading {
    /// Output current and power are stored as magnitudes; the meter reports
    /// them negative when the wiring direction is reversed.
    pub fn new(timestamp: DateTime<Local>, input: Measurement, output: Measurement) -> Self {
        Reading {
            timestamp,
            input_voltage: input.voltage,
            input_current: input.current,
            input_power: input.power,
            output_voltage: output.voltage,
            output_current: output.current.abs(),
            output_power: output.power.abs(),
        }
    }

    pub fn timestamp_label(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}
