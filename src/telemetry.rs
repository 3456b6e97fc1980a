//! Experiment directory and its files.
//!
//! Layout of one run:
//!
//! ```text
//! <root>/<name>/details.json
//! <root>/<name>/experiment_log.txt
//! <root>/<name>/temperature_data.txt
//! <root>/<name>/<ramp>_<up|down>/<T>C/<T>C_sweep_<n>.txt
//! <root>/<name>/temp_profile.png
//! ```
//!
//! Every append opens its file, writes one line and closes it again, so an abrupt
//! termination leaves at worst one missing line. `details.json` is replaced atomically
//! through a temporary file.

use crate::analyser::SweepResult;
use crate::error::{AppResult, VtiError};
use crate::planner::Direction;
use chrono::Local;
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DETAILS_FILE: &str = "details.json";
pub const LOG_FILE: &str = "experiment_log.txt";
pub const TEMPERATURE_FILE: &str = "temperature_data.txt";
pub const PROFILE_PLOT: &str = "temp_profile.png";

pub const TEMPERATURE_HEADER: &str = "seconds, temperature";
pub const SWEEP_HEADER: &str = "sweep_num,date,time,Tcell,setT,direction";

const DATE_FORMAT: &str = "%d/%m/%Y";
const TIME_FORMAT: &str = "%H:%M:%S";

/// Contents of `details.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub experiment_name: String,
    pub notes: String,
    /// Local start time, ISO-8601
    pub datetime: String,
    pub complete: bool,
    pub stage: String,
    pub analyser: String,
    /// One entry per ramp, every field except the frequency list
    pub ramps: Vec<serde_json::Value>,
    /// `H:MM:SS`
    pub estimated_time: String,
    /// `H:MM:SS`, written when the run ends
    #[serde(default)]
    pub time_elapsed: Option<String>,
}

/// One line of the temperature log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    pub elapsed_seconds: u64,
    pub temperature: f64,
}

/// Where the run is, for prefixing experiment log lines.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LogContext {
    pub ramp: usize,
    pub num_ramps: usize,
    /// Current set-point and its 1-based position in the ramp
    pub set_point: Option<(f64, usize, usize)>,
    pub temperature: Option<f64>,
}

impl LogContext {
    fn render(&self, status: &str) -> String {
        let point = match self.set_point {
            Some((t, j, m)) => format!("{} °C {} / {}", t, j, m),
            None => "-".to_string(),
        };
        let temperature = match self.temperature {
            Some(t) => format!("{:.2}", t),
            None => "-".to_string(),
        };
        format!(
            "{} | Ramp : {} / {} | Temp Point : {} | T : {} °C | {}",
            Local::now().format("%d/%m/%Y %H:%M:%S"),
            self.ramp,
            self.num_ramps,
            point,
            temperature,
            status
        )
    }
}

/// Header values of one sweep file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepHeader {
    /// 1-based sweep number at this set-point
    pub sweep_number: u32,
    pub cell_temperature: f64,
    pub set_point: f64,
    pub direction: Direction,
}

/// Appends results to one sweep file.
#[derive(Debug)]
pub struct SweepWriter {
    path: PathBuf,
    rows: usize,
}

impl SweepWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn append(&mut self, result: &SweepResult) -> AppResult<()> {
        append_line(&self.path, &result.to_row())?;
        self.rows += 1;
        Ok(())
    }
}

/// Owns one experiment directory.
#[derive(Debug, Clone)]
pub struct TelemetryRecorder {
    dir: PathBuf,
    name: String,
}

impl TelemetryRecorder {
    /// Creates `<root>/<name>`, or `<name>_1`, `<name>_2`, … if it already exists.
    pub fn create(root: &Path, name: &str) -> AppResult<Self> {
        fs::create_dir_all(root)?;
        let mut suffix = 0u32;
        loop {
            let candidate = match suffix {
                0 => name.to_string(),
                n => format!("{}_{}", name, n),
            };
            let dir = root.join(&candidate);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "Experiment directory created");
                    return Ok(Self {
                        dir,
                        name: candidate,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Opens an existing experiment directory.
    pub fn open(dir: &Path) -> AppResult<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "experiment path has no name")
            })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final, de-duplicated experiment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_record(&self, record: &ExperimentRecord) -> AppResult<()> {
        let path = self.dir.join(DETAILS_FILE);
        let tmp = self.dir.join(format!("{}.tmp", DETAILS_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_record(&self) -> AppResult<ExperimentRecord> {
        let content = fs::read_to_string(self.dir.join(DETAILS_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Reads, modifies and rewrites `details.json`.
    pub fn update_record(&self, f: impl FnOnce(&mut ExperimentRecord)) -> AppResult<()> {
        let mut record = self.read_record()?;
        f(&mut record);
        self.write_record(&record)
    }

    pub fn start_log(&self) -> AppResult<()> {
        fs::write(
            self.dir.join(LOG_FILE),
            format!("Experiment Log File for: {}\n", self.name),
        )?;
        Ok(())
    }

    pub fn append_log(&self, context: &LogContext, status: &str) -> AppResult<()> {
        append_line(&self.dir.join(LOG_FILE), &context.render(status))
    }

    pub fn start_temperature_log(&self) -> AppResult<()> {
        fs::write(
            self.dir.join(TEMPERATURE_FILE),
            format!("{}\n", TEMPERATURE_HEADER),
        )?;
        Ok(())
    }

    pub fn append_temperature(&self, sample: &TemperatureSample) -> AppResult<()> {
        append_line(
            &self.dir.join(TEMPERATURE_FILE),
            &format!("{},{:.2}", sample.elapsed_seconds, sample.temperature),
        )
    }

    /// Parses the temperature log, skipping lines that do not parse.
    pub fn read_temperature_log(&self) -> AppResult<Vec<TemperatureSample>> {
        let content = fs::read_to_string(self.dir.join(TEMPERATURE_FILE))?;
        let mut samples = Vec::new();
        for (n, line) in content.lines().enumerate().skip(1) {
            match parse_sample(line) {
                Some(sample) => samples.push(sample),
                None => warn!(line = n + 1, content = line, "Skipping bad temperature line"),
            }
        }
        Ok(samples)
    }

    /// Creates `<index>_<up|down>/` for a ramp.
    pub fn create_ramp_dir(&self, index: usize, direction: Direction) -> AppResult<PathBuf> {
        let dir = self.dir.join(format!("{}_{}", index, direction));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Creates `<T>C/<T>C_sweep_<n>.txt` under `ramp_dir` and writes its header.
    pub fn create_sweep_file(&self, ramp_dir: &Path, header: &SweepHeader) -> AppResult<SweepWriter> {
        let label = format!("{}C", header.set_point);
        let point_dir = ramp_dir.join(&label);
        fs::create_dir_all(&point_dir)?;

        let path = point_dir.join(format!("{}_sweep_{}.txt", label, header.sweep_number));
        let now = Local::now();
        let values = format!(
            "{},{},{},{:.2},{},{}",
            header.sweep_number,
            now.format(DATE_FORMAT),
            now.format(TIME_FORMAT),
            header.cell_temperature,
            header.set_point,
            header.direction
        );
        fs::write(&path, format!("{}\n{}\n", SWEEP_HEADER, values))?;
        Ok(SweepWriter { path, rows: 0 })
    }

    /// Draws temperature against elapsed minutes into `temp_profile.png`.
    pub fn render_profile(&self, samples: &[TemperatureSample]) -> AppResult<PathBuf> {
        let path = self.dir.join(PROFILE_PLOT);
        draw_profile(&path, samples).map_err(|e| VtiError::Plot(e.to_string()))?;
        Ok(path)
    }
}

fn append_line(path: &Path, line: &str) -> AppResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn parse_sample(line: &str) -> Option<TemperatureSample> {
    let (seconds, temperature) = line.split_once(',')?;
    Some(TemperatureSample {
        elapsed_seconds: seconds.trim().parse().ok()?,
        temperature: temperature.trim().parse().ok()?,
    })
}

fn draw_profile(path: &Path, samples: &[TemperatureSample]) -> Result<(), Box<dyn std::error::Error>> {
    let minutes: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (s.elapsed_seconds as f64 / 60.0, s.temperature))
        .collect();

    let x_max = minutes.last().map_or(0.0, |(m, _)| m + 1.0).max(5.0);
    let (t_min, t_max) = minutes
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, t)| {
            (lo.min(*t), hi.max(*t))
        });
    let (t_min, t_max) = if t_min.is_finite() {
        (t_min - 5.0, t_max + 5.0)
    } else {
        (0.0, 100.0)
    };

    let root = BitMapBackend::new(path, (2000, 1200)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Temperature Profile", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(80)
        .build_cartesian_2d(0.0..x_max, t_min..t_max)?;

    chart
        .configure_mesh()
        .x_desc("Time (min)")
        .y_desc("Temperature (°C)")
        .draw()?;
    chart.draw_series(LineSeries::new(minutes, &RED))?;
    root.present()?;
    Ok(())
}

/// Formats a duration as `H:MM:SS`.
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::ImpedanceReading;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn record(name: &str) -> ExperimentRecord {
        ExperimentRecord {
            experiment_name: name.to_string(),
            notes: String::new(),
            datetime: "2024-01-01T00:00:00".to_string(),
            complete: false,
            stage: "Virtual Stage".to_string(),
            analyser: "Virtual Analyser".to_string(),
            ramps: Vec::new(),
            estimated_time: "0:10:00".to_string(),
            time_elapsed: None,
        }
    }

    #[test]
    fn test_name_deduplication() {
        let root = TempDir::new().unwrap();
        let a = TelemetryRecorder::create(root.path(), "run").unwrap();
        let b = TelemetryRecorder::create(root.path(), "run").unwrap();
        let c = TelemetryRecorder::create(root.path(), "run").unwrap();
        assert_eq!(a.name(), "run");
        assert_eq!(b.name(), "run_1");
        assert_eq!(c.name(), "run_2");
        assert!(c.dir().is_dir());
    }

    #[test]
    fn test_record_update() {
        let root = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::create(root.path(), "run").unwrap();
        recorder.write_record(&record("run")).unwrap();
        recorder
            .update_record(|r| {
                r.complete = true;
                r.time_elapsed = Some("0:01:05".to_string());
            })
            .unwrap();

        let read = recorder.read_record().unwrap();
        assert!(read.complete);
        assert_eq!(read.time_elapsed.as_deref(), Some("0:01:05"));
        assert!(!recorder.dir().join("details.json.tmp").exists());
    }

    #[test]
    #[traced_test]
    fn test_temperature_log_skips_bad_lines() {
        let root = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::create(root.path(), "run").unwrap();
        recorder.start_temperature_log().unwrap();
        recorder
            .append_temperature(&TemperatureSample {
                elapsed_seconds: 0,
                temperature: 22.0,
            })
            .unwrap();
        append_line(&recorder.dir().join(TEMPERATURE_FILE), "garbage").unwrap();
        recorder
            .append_temperature(&TemperatureSample {
                elapsed_seconds: 1,
                temperature: 22.456,
            })
            .unwrap();

        let content = fs::read_to_string(recorder.dir().join(TEMPERATURE_FILE)).unwrap();
        assert!(content.starts_with("seconds, temperature\n0,22.00\n"));

        let samples = recorder.read_temperature_log().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].temperature, 22.46);
        assert!(logs_contain("Skipping bad temperature line"));
    }

    #[test]
    fn test_log_line_format() {
        let root = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::create(root.path(), "run").unwrap();
        recorder.start_log().unwrap();
        let context = LogContext {
            ramp: 1,
            num_ramps: 2,
            set_point: Some((40.0, 2, 4)),
            temperature: Some(39.5),
        };
        recorder.append_log(&context, "Beginning sweep 1 / 1.").unwrap();

        let content = fs::read_to_string(recorder.dir().join(LOG_FILE)).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("Experiment Log File for: run"));
        let line = lines.next().unwrap();
        assert!(line.ends_with(
            " | Ramp : 1 / 2 | Temp Point : 40 °C 2 / 4 | T : 39.50 °C | Beginning sweep 1 / 1."
        ));
        assert_eq!(line.split(" | ").next().unwrap().len(), "dd/mm/YYYY HH:MM:SS".len());
    }

    #[test]
    fn test_sweep_file_layout() {
        let root = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::create(root.path(), "run").unwrap();
        let ramp_dir = recorder.create_ramp_dir(2, Direction::Down).unwrap();
        let mut writer = recorder
            .create_sweep_file(
                &ramp_dir,
                &SweepHeader {
                    sweep_number: 3,
                    cell_temperature: 49.987,
                    set_point: 50.0,
                    direction: Direction::Down,
                },
            )
            .unwrap();
        writer
            .append(&SweepResult {
                reading: ImpedanceReading::polar(1000.0, 250.5, -12.0),
                cell_temperature: 49.987,
                direction: Direction::Down,
            })
            .unwrap();

        assert_eq!(
            writer.path(),
            recorder.dir().join("2_down").join("50C").join("50C_sweep_3.txt")
        );
        let content = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], SWEEP_HEADER);
        assert!(lines[1].starts_with("3,"));
        assert!(lines[1].ends_with(",49.99,50,down"));
        assert_eq!(lines[2], "1000,250.5,-12");
        assert_eq!(writer.rows(), 1);
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_hms(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_hms(Duration::from_secs(36_000)), "10:00:00");
    }
}
