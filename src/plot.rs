//! Output voltage and current against elapsed time, rendered to SVG.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use plotters::prelude::*;

use crate::error::{Error, Result};
use crate::reading::TIMESTAMP_FORMAT;

const SIZE: (u32, u32) = (1280, 720);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotPoint {
    pub elapsed_s: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Points accumulated over a run.
#[derive(Debug, Clone, Default)]
pub struct PlotSeries {
    points: Vec<PlotPoint>,
}

/// The plot artifact that accompanies `csv_path`.
pub fn artifact_path(csv_path: &Path) -> PathBuf {
    csv_path.with_extension("svg")
}

fn plot_err(e: impl std::fmt::Display) -> Error {
    Error::Plot(e.to_string())
}

impl PlotSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: PlotPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[PlotPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Rebuild a series from a CSV log in either layout.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let column = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.contains(&h))
                .ok_or_else(|| Error::Plot(format!("{} has no {} column", path.display(), names[0])))
        };
        let ts_col = column(&["Timestamp"])?;
        let v_col = column(&["Output_Voltage(V)", "Voltage(V)"])?;
        let i_col = column(&["Output_Current(A)", "Current(A)"])?;

        let mut series = PlotSeries::new();
        let mut first: Option<NaiveDateTime> = None;
        for record in reader.records() {
            let record = record?;
            let field = |idx: usize| record.get(idx).unwrap_or_default().trim();
            let at = NaiveDateTime::parse_from_str(field(ts_col), TIMESTAMP_FORMAT)
                .map_err(|e| Error::Plot(format!("bad timestamp {:?}: {e}", field(ts_col))))?;
            let start = *first.get_or_insert(at);
            let number = |idx: usize| {
                field(idx)
                    .parse::<f64>()
                    .map_err(|e| Error::Plot(format!("bad value {:?}: {e}", field(idx))))
            };
            series.push(PlotPoint {
                elapsed_s: (at - start).num_milliseconds() as f64 / 1000.0,
                voltage: number(v_col)?,
                current: number(i_col)?,
            });
        }
        Ok(series)
    }

    fn bounds(&self) -> (f64, f64, f64) {
        let x_max = self
            .points
            .iter()
            .map(|p| p.elapsed_s)
            .fold(1.0_f64, f64::max);
        let values = self.points.iter().flat_map(|p| [p.voltage, p.current]);
        let (lo, hi) = values.fold((0.0_f64, 0.0_f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let span = (hi - lo).max(1.0);
        (x_max, lo - span * 0.05, hi + span * 0.05)
    }

    pub fn render(&self, path: &Path) -> Result<()> {
        let (x_max, y_min, y_max) = self.bounds();

        let root = SVGBackend::new(path, SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;

        let mut chart = ChartBuilder::on(&root)
            .caption("Output Voltage & Current vs Time", ("sans-serif", 24))
            .margin(16)
            .x_label_area_size(40)
            .y_label_area_size(56)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)
            .map_err(plot_err)?;

        chart
            .configure_mesh()
            .x_desc("Elapsed Time (s)")
            .y_desc("Output Values")
            .draw()
            .map_err(plot_err)?;

        chart
            .draw_series(LineSeries::new(
                self.points.iter().map(|p| (p.elapsed_s, p.voltage)),
                &BLUE,
            ))
            .map_err(plot_err)?
            .label("Output Voltage (V)")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

        chart
            .draw_series(LineSeries::new(
                self.points.iter().map(|p| (p.elapsed_s, p.current)),
                &RED,
            ))
            .map_err(plot_err)?
            .label("Output Current (A)")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(plot_err)?;

        root.present().map_err(plot_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn artifact_shares_the_csv_base_name() {
        let csv = Path::new("/tmp/logs/charging_log_20251215_142555.csv");
        assert_eq!(
            artifact_path(csv),
            Path::new("/tmp/logs/charging_log_20251215_142555.svg")
        );
    }

    #[test]
    fn renders_svg_with_both_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.svg");
        let mut series = PlotSeries::new();
        for k in 0..5 {
            series.push(PlotPoint {
                elapsed_s: f64::from(k) * 10.0,
                voltage: 7.9 + f64::from(k) * 0.1,
                current: 2.0 - f64::from(k) * 0.2,
            });
        }

        series.render(&path).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Output Voltage (V)"));
        assert!(svg.contains("Output Current (A)"));
    }

    #[test]
    fn renders_an_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.svg");
        PlotSeries::new().render(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn rebuilds_series_from_either_csv_layout() {
        let dir = tempfile::tempdir().unwrap();

        let full = dir.path().join("full.csv");
        let mut f = std::fs::File::create(&full).unwrap();
        writeln!(f, "Timestamp,Input_Voltage(V),Input_Current(A),Input_Power(W),Output_Voltage(V),Output_Current(A),Output_Power(W)").unwrap();
        writeln!(f, "2025-12-15 14:25:55,12.0,2.0,24.0,8.0,1.5,12.0").unwrap();
        writeln!(f, "2025-12-15 14:26:05,12.0,1.9,22.8,8.1,1.4,11.3").unwrap();
        drop(f);

        let series = PlotSeries::from_csv(&full).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(
            series.points()[1],
            PlotPoint {
                elapsed_s: 10.0,
                voltage: 8.1,
                current: 1.4
            }
        );

        let short = dir.path().join("short.csv");
        std::fs::write(
            &short,
            "Timestamp,Voltage(V),Current(A),Power(W)\n2025-12-15 14:25:55,8.2,1.1,9.0\n",
        )
        .unwrap();
        let series = PlotSeries::from_csv(&short).unwrap();
        assert_eq!(series.points()[0].voltage, 8.2);
    }

    #[test]
    fn missing_columns_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.csv");
        std::fs::write(&path, "time,value\n1,2\n").unwrap();
        assert!(matches!(PlotSeries::from_csv(&path), Err(Error::Plot(_))));
    }
}
