//! Drive-cycle profiles replayed by the plate drive-cycle test.
//!
//! A profile is a CSV file without header, one record per line:
//! `time_delta_s,aux,raw_power`. The requested power is `raw_power / 16` kW,
//! positive values discharge the plate.

use crate::Error;
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Highest power (kW) the profile may request.
pub const POWER_CEILING_KW: f32 = 70.0;
const POWER_DIVISOR: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveCycleRecord {
    pub time_delta: Duration,
    pub aux: f32,
    pub power_kw: f32,
}

#[derive(Debug, Deserialize)]
struct RawRecord(f32, f32, f32);

impl TryFrom<RawRecord> for DriveCycleRecord {
    type Error = Error;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let RawRecord(delta, aux, power) = raw;
        if !(delta.is_finite() && aux.is_finite() && power.is_finite()) {
            return Err(Error::DriveCycleRecord(format!(
                "non-finite field in {delta},{aux},{power}"
            )));
        }
        let time_delta = Duration::try_from_secs_f32(delta.max(0.0))
            .map_err(|e| Error::DriveCycleRecord(format!("time delta {delta}: {e}")))?;
        Ok(Self {
            time_delta,
            aux,
            power_kw: power / POWER_DIVISOR,
        })
    }
}

/// A finite, non-restartable stream of records.
pub trait DriveCycleSource: Send {
    /// `Ok(None)` at the end of the profile.
    fn next_record(&mut self) -> Result<Option<DriveCycleRecord>, Error>;
}

/// Opens a fresh source for every test run.
pub trait DriveCycleProvider: Send + Sync {
    fn open(&self) -> Result<Box<dyn DriveCycleSource>, Error>;
}

pub struct CsvDriveCycle<R: Read> {
    records: csv::DeserializeRecordsIntoIter<R, RawRecord>,
}

impl<R: Read> CsvDriveCycle<R> {
    pub fn from_reader(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(reader);
        Self {
            records: reader.into_deserialize(),
        }
    }
}

impl<R: Read + Send> DriveCycleSource for CsvDriveCycle<R> {
    fn next_record(&mut self) -> Result<Option<DriveCycleRecord>, Error> {
        match self.records.next() {
            Some(record) => Ok(Some(record?.try_into()?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvDriveCycleFile {
    path: PathBuf,
}

impl CsvDriveCycleFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DriveCycleProvider for CsvDriveCycleFile {
    fn open(&self) -> Result<Box<dyn DriveCycleSource>, Error> {
        let file = File::open(&self.path)?;
        Ok(Box::new(CsvDriveCycle::from_reader(file)))
    }
}

/// Power (kW) to apply to channel A for a requested profile power. The
/// request is capped at [`POWER_CEILING_KW`] and then at what the plate can
/// deliver or absorb. Discharge is returned negative.
pub fn clamp_drive_power(requested_kw: f32, available_kw: f32, charging_kw: f32) -> f32 {
    let requested = requested_kw.min(POWER_CEILING_KW);
    if requested >= 0.0 {
        -requested.min(available_kw)
    } else {
        requested.abs().min(charging_kw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp() {
        assert_eq!(clamp_drive_power(90.0, 50.0, 20.0), -50.0);
        assert_eq!(clamp_drive_power(90.0, 100.0, 20.0), -70.0);
        assert_eq!(clamp_drive_power(30.0, 50.0, 20.0), -30.0);
        assert_eq!(clamp_drive_power(-10.0, 50.0, 20.0), 10.0);
        assert_eq!(clamp_drive_power(-30.0, 50.0, 20.0), 20.0);
        assert_eq!(clamp_drive_power(0.0, 50.0, 20.0), 0.0);
    }

    #[test]
    fn csv_records() {
        let data = "1, 0, 320\n0.5,2,-160\n";
        let mut source = CsvDriveCycle::from_reader(data.as_bytes());
        let first = source.next_record().unwrap().unwrap();
        assert_eq!(first.time_delta, Duration::from_secs(1));
        assert_eq!(first.power_kw, 20.0);
        let second = source.next_record().unwrap().unwrap();
        assert_eq!(second.time_delta, Duration::from_millis(500));
        assert_eq!(second.aux, 2.0);
        assert_eq!(second.power_kw, -10.0);
        assert!(source.next_record().unwrap().is_none());
    }

    #[test]
    fn csv_unreadable_record() {
        let mut source = CsvDriveCycle::from_reader("1,0,abc\n".as_bytes());
        assert!(matches!(source.next_record(), Err(Error::Csv(_))));
    }

    #[test]
    fn csv_rejects_non_finite_fields() {
        for row in ["inf,0,100\n", "1e30,0,100\n", "1,0,NaN\n", "1,inf,16\n"] {
            let mut source = CsvDriveCycle::from_reader(row.as_bytes());
            assert!(
                matches!(source.next_record(), Err(Error::DriveCycleRecord(_))),
                "{row:?} accepted"
            );
        }
    }

    #[test]
    fn missing_file() {
        let provider = CsvDriveCycleFile::new("/nonexistent/drive_cycle.csv");
        assert!(matches!(provider.open(), Err(Error::Io(_))));
    }
}
