//! Calibration source (C7): spawns the external Jones-matrix generator and
//! parses its FIFO output into a lazy matrix table.
//!
//! The generator itself is an external collaborator (see the purpose/scope
//! note in the design doc); this module only implements the FIFO framing
//! contract and the process lifecycle around it.

use std::ffi::CString;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One 2x2 complex Jones matrix, row-major: `[xx, xy, yx, yy]`.
pub type Jones = [Complex<f32>; 4];

/// Configuration for the external Jones-matrix generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfiguration {
    /// Directory the FIFO is created in; the FIFO's own name is generated.
    pub fifo_dir: PathBuf,
    /// Path to the external generator binary.
    pub generator_path: PathBuf,
    /// Subband specification string, passed through verbatim.
    pub subband_spec: String,
    /// Pointing as two angles, interpreted per `pointing_basis`.
    pub pointing: [f64; 2],
    /// Coordinate basis code for `pointing` (e.g. `"J2000"`, `"AZEL"`).
    pub pointing_basis: String,
    /// Integration time, in seconds, the generator should assume per sample.
    pub integration_time: f64,
    /// MJD of the integration's start.
    pub mjd_start: f64,
    /// Requested integration duration, in seconds.
    pub duration: f64,
    /// Integration step, in seconds.
    pub integration_step: f64,
}

/// A lazily-regenerated table of Jones matrices, one per (time step,
/// beamlet) pair, produced by the external generator over its FIFO.
pub struct CalibrationSource {
    config: CalibrationConfiguration,
    total_beamlets: usize,
    station_code: String,
    matrices: Vec<Jones>, // flattened [t][beamlet]
    steps_generated: usize,
    current_fifo: Option<PathBuf>,
}

impl CalibrationSource {
    /// Run the FIFO protocol once and return a source with its first batch
    /// of matrices loaded.
    pub fn start(config: CalibrationConfiguration, total_beamlets: usize, station_code: String) -> Result<Self> {
        let mut source = Self {
            config,
            total_beamlets,
            station_code,
            matrices: Vec::new(),
            steps_generated: 0,
            current_fifo: None,
        };
        source.regenerate()?;
        Ok(source)
    }

    /// Number of time steps currently loaded in the table.
    pub fn steps_generated(&self) -> usize {
        self.steps_generated
    }

    /// Look up the matrix for `(step, beamlet)`, wrapping `step` modulo the
    /// generated table length.
    pub fn jones_at(&self, step: u64, beamlet: usize) -> Jones {
        let t = (step as usize) % self.steps_generated.max(1);
        self.matrices[t * self.total_beamlets + beamlet]
    }

    /// Re-run the FIFO protocol to produce a fresh batch of matrices,
    /// replacing the current table.
    pub fn regenerate(&mut self) -> Result<()> {
        let fifo_path = self.config.fifo_dir.join(format!(
            "jones_{}_{}.fifo",
            std::process::id(),
            self.steps_generated
        ));
        create_fifo(&fifo_path)?;
        self.current_fifo = Some(fifo_path.clone());

        let mut child = spawn_generator(&self.config, &self.station_code, &fifo_path)?;
        let result = read_fifo(&mut child, &fifo_path, self.total_beamlets);

        let _ = std::fs::remove_file(&fifo_path);
        self.current_fifo = None;
        let _ = child.wait();

        let (steps, matrices) = result?;
        self.steps_generated = steps;
        self.matrices = matrices;
        Ok(())
    }

    /// Stop the generator (if still alive) and remove any leftover FIFO.
    pub fn stop(mut self) {
        if let Some(path) = self.current_fifo.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for CalibrationSource {
    fn drop(&mut self) {
        if let Some(path) = self.current_fifo.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn create_fifo(path: &std::path::Path) -> Result<()> {
    let cpath = CString::new(path.as_os_str().to_string_lossy().into_owned())
        .map_err(|e| Error::CalibrationFailed(format!("fifo path contains NUL: {e}")))?;
    // Safety: mkfifo only creates a special file at a path we own; failure
    // is surfaced through errno below rather than undefined behaviour.
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(Error::CalibrationFailed(format!(
            "mkfifo({}) failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn spawn_generator(
    config: &CalibrationConfiguration,
    station_code: &str,
    fifo_path: &std::path::Path,
) -> Result<Child> {
    Command::new(&config.generator_path)
        .arg(station_code)
        .arg(config.integration_time.to_string())
        .arg(config.mjd_start.to_string())
        .arg(config.duration.to_string())
        .arg(config.integration_step.to_string())
        .arg(&config.subband_spec)
        .arg(config.pointing[0].to_string())
        .arg(config.pointing[1].to_string())
        .arg(&config.pointing_basis)
        .arg(fifo_path)
        .envs(std::iter::empty::<(String, String)>())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            Error::CalibrationFailed(format!(
                "spawning {}: {e}",
                config.generator_path.display()
            ))
        })
}

/// Open and parse the FIFO: a `"<T>,<B>\n"` header line, then `T` lines of
/// `B` pipe/comma-delimited 8-float Jones tuples.
fn read_fifo(child: &mut Child, fifo_path: &std::path::Path, total_beamlets: usize) -> Result<(usize, Vec<Jones>)> {
    if let Ok(Some(status)) = child.try_wait() {
        return Err(Error::CalibrationFailed(format!(
            "generator exited before opening fifo: {status}"
        )));
    }
    let file = std::fs::File::open(fifo_path)
        .map_err(|e| Error::CalibrationFailed(format!("opening fifo {}: {e}", fifo_path.display())))?;
    let mut reader = BufReader::new(file);

    let mut header = String::new();
    reader
        .read_line(&mut header)
        .map_err(|e| Error::CalibrationFailed(format!("reading fifo header: {e}")))?;
    let (t_str, b_str) = header
        .trim()
        .split_once(',')
        .ok_or_else(|| Error::CalibrationFailed(format!("malformed fifo header: {header:?}")))?;
    let steps: usize = t_str
        .parse()
        .map_err(|e| Error::CalibrationFailed(format!("bad step count {t_str:?}: {e}")))?;
    let beamlets: usize = b_str
        .parse()
        .map_err(|e| Error::CalibrationFailed(format!("bad beamlet count {b_str:?}: {e}")))?;
    if beamlets != total_beamlets {
        return Err(Error::CalibrationFailed(format!(
            "generator reported {beamlets} beamlets, expected {total_beamlets}"
        )));
    }

    let mut matrices = Vec::with_capacity(steps * beamlets);
    for t in 0..steps {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(Error::CalibrationFailed(format!(
                "generator exited mid-stream at step {t}: {status}"
            )));
        }
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| Error::CalibrationFailed(format!("reading fifo line {t}: {e}")))?;
        if n == 0 {
            return Err(Error::CalibrationFailed(format!(
                "fifo closed early at step {t} of {steps}"
            )));
        }
        parse_jones_line(&line, beamlets, &mut matrices)?;
    }

    Ok((steps, matrices))
}

fn parse_jones_line(line: &str, beamlets: usize, out: &mut Vec<Jones>) -> Result<()> {
    let body = line.trim().trim_end_matches('|');
    let groups: Vec<&str> = body.split(['|', ',']).collect();
    // 8 floats per beamlet.
    if groups.len() < beamlets * 8 {
        return Err(Error::CalibrationFailed(format!(
            "fifo line has {} fields, expected at least {}",
            groups.len(),
            beamlets * 8
        )));
    }
    for b in 0..beamlets {
        let base = b * 8;
        let f = |i: usize| -> Result<f32> {
            groups[base + i]
                .trim()
                .parse::<f32>()
                .map_err(|e| Error::CalibrationFailed(format!("bad float in fifo line: {e}")))
        };
        out.push([
            Complex::new(f(0)?, f(1)?),
            Complex::new(f(2)?, f(3)?),
            Complex::new(f(4)?, f(5)?),
            Complex::new(f(6)?, f(7)?),
        ]);
    }
    Ok(())
}
