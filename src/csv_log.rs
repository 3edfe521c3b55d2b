use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::Context;

use crate::reading::Reading;

pub const HEADER: [&str; 5] = ["date", "co2", "temperature", "humidity", "pressure"];

const LOG_RELATIVE_PATH: &str = "data/house/aranet_history.csv";

// The last line is always near the end; one tail chunk is plenty.
const TAIL_CHUNK: u64 = 8 * 1024;

pub fn default_path() -> Result<PathBuf, anyhow::Error> {
    let home = dirs::home_dir().context("Failed to locate the home directory")?;
    Ok(home.join(LOG_RELATIVE_PATH))
}

#[derive(Debug)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    pub fn new(path: impl Into<PathBuf>) -> CsvLog {
        CsvLog { path: path.into() }
    }

    // Appends the suffix of `readings` not yet in the file and returns the
    // number of rows written.
    pub fn append_new(&self, readings: &[Reading]) -> Result<usize, anyhow::Error> {
        let last_line = self.read_last_line()?;
        let resume = match last_line.as_deref() {
            Some(line) => find_matching_index(line, readings)?,
            None => None,
        };
        match resume {
            Some(index) => log::info!("Found matching record at index {index}"),
            None if last_line.is_some() => log::warn!(
                "Unable to find matching record in the file. Writing all records (may duplicate rows)"
            ),
            None => {}
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let write_header = file.metadata().context("Failed to read log metadata")?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(HEADER).context("Failed to write the CSV header")?;
            log::info!("CSV header written");
        }

        let start = resume.map_or(0, |index| index + 1);
        let mut written = 0;
        for reading in &readings[start..] {
            writer.serialize(reading).context("Failed to write a reading")?;
            written += 1;
        }
        writer.flush().context("Failed to flush the log")?;

        log::info!("{written} records written to {}", self.path.display());
        Ok(written)
    }

    fn read_last_line(&self) -> Result<Option<String>, anyhow::Error> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(format!("Failed to open {}", self.path.display()));
            }
        };
        let len = file.metadata().context("Failed to read log metadata")?.len();
        if len == 0 {
            return Ok(None);
        }

        let take = len.min(TAIL_CHUNK);
        file.seek(SeekFrom::End(-(take as i64)))
            .context("Failed to seek to the log tail")?;
        let mut tail = Vec::with_capacity(take as usize);
        file.read_to_end(&mut tail).context("Failed to read the log tail")?;

        let text = String::from_utf8_lossy(&tail);
        Ok(text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_owned))
    }
}

// Serializes one reading exactly as `append_new` writes it, without the line
// terminator, so the resume match compares like with like.
fn to_row(reading: &Reading) -> Result<String, anyhow::Error> {
    let mut buf = Vec::new();
    {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&mut buf);
        writer.serialize(reading).context("Failed to serialize a reading")?;
        writer.flush().context("Failed to flush the row buffer")?;
    }
    let row = String::from_utf8(buf).context("Serialized row is not valid UTF-8")?;
    Ok(row.trim_end().to_string())
}

fn find_matching_index(
    last_line: &str,
    readings: &[Reading],
) -> Result<Option<usize>, anyhow::Error> {
    let wanted = last_line.trim();
    for (index, reading) in readings.iter().enumerate() {
        if to_row(reading)? == wanted {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Local};
    use tempfile::tempdir;

    use super::*;

    fn reading(date: &str, co2: u16, temperature: f32, humidity: u16, pressure: f32) -> Reading {
        Reading {
            timestamp: DateTime::parse_from_rfc3339(date).unwrap().with_timezone(&Local),
            co2,
            temperature,
            humidity,
            pressure,
        }
    }

    fn fetched() -> Vec<Reading> {
        vec![
            reading("2024-05-04T11:00:00+00:00", 489, 21.0, 38, 1012.6),
            reading("2024-05-04T11:05:00+00:00", 514, 21.55, 39, 1012.8),
            reading("2024-05-04T11:10:00+00:00", 531, 21.6, 39, 1013.0),
            reading("2024-05-04T11:15:00+00:00", 579, 21.75, 40, 1013.1),
        ]
    }

    #[test]
    fn first_run_writes_header_and_all_rows() {
        let dir = tempdir().unwrap();
        // Parent directories are created on demand.
        let path = dir.path().join("data/house/history.csv");
        let log = CsvLog::new(&path);

        let written = log.append_new(&fetched()).unwrap();

        assert_eq!(written, 4);
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "date,co2,temperature,humidity,pressure");
        assert_eq!(lines[1], to_row(&fetched()[0]).unwrap());
        assert!(lines[1].ends_with(",489,21.0,38,1012.6"));
    }

    #[test]
    fn rerun_with_same_sequence_appends_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let log = CsvLog::new(&path);
        log.append_new(&fetched()).unwrap();
        let before = fs::read(&path).unwrap();

        let written = log.append_new(&fetched()).unwrap();

        assert_eq!(written, 0);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn appends_only_records_after_the_matched_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let log = CsvLog::new(&path);
        let all = fetched();
        log.append_new(&all[..2]).unwrap();

        // The file's last row is all[1], which is index 0 of this fetch.
        let written = log.append_new(&all[1..]).unwrap();

        assert_eq!(written, 2);
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[4], to_row(&all[3]).unwrap());
    }

    #[test]
    fn unmatched_last_line_appends_the_entire_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let log = CsvLog::new(&path);
        let stale = reading("2024-01-01T00:00:00+00:00", 400, 19.0, 35, 1001.0);
        log.append_new(&[stale]).unwrap();

        let written = log.append_new(&fetched()).unwrap();

        assert_eq!(written, 4);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 6);
    }

    #[test]
    fn empty_existing_file_still_gets_a_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        File::create(&path).unwrap();
        let log = CsvLog::new(&path);

        let written = log.append_new(&fetched()[..3]).unwrap();

        assert_eq!(written, 3);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("date,co2,temperature,humidity,pressure\n"));
        assert_eq!(content.lines().count(), 4);
    }

    #[test]
    fn header_only_file_takes_the_duplication_fallback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        fs::write(&path, "date,co2,temperature,humidity,pressure\n").unwrap();
        let log = CsvLog::new(&path);

        let written = log.append_new(&fetched()).unwrap();

        assert_eq!(written, 4);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 5);
        assert_eq!(content.matches("date,").count(), 1);
    }

    #[test]
    fn missing_trailing_newline_still_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let all = fetched();
        let mut content = String::from("date,co2,temperature,humidity,pressure\n");
        content.push_str(&to_row(&all[0]).unwrap());
        fs::write(&path, &content).unwrap();
        let log = CsvLog::new(&path);

        let written = log.append_new(&all).unwrap();

        assert_eq!(written, 3);
    }

    #[test]
    fn empty_fetch_on_a_fresh_path_leaves_a_header_only_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let log = CsvLog::new(&path);

        let written = log.append_new(&[]).unwrap();

        assert_eq!(written, 0);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "date,co2,temperature,humidity,pressure\n"
        );
    }

    #[test]
    fn read_last_line_handles_missing_empty_and_unterminated_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let log = CsvLog::new(&path);

        assert_eq!(log.read_last_line().unwrap(), None);

        fs::write(&path, "").unwrap();
        assert_eq!(log.read_last_line().unwrap(), None);

        fs::write(&path, "\n\n").unwrap();
        assert_eq!(log.read_last_line().unwrap(), None);

        fs::write(&path, "header\nrow1\nrow2\n").unwrap();
        assert_eq!(log.read_last_line().unwrap().as_deref(), Some("row2"));

        fs::write(&path, "header\nrow1\nrow2").unwrap();
        assert_eq!(log.read_last_line().unwrap().as_deref(), Some("row2"));
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let original = reading("2024-05-04T11:05:00+00:00", 514, 21.55, 39, 1012.8);
        let row = to_row(&original).unwrap();

        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(row.as_bytes());
        let parsed: Reading = csv_reader.deserialize().next().unwrap().unwrap();

        assert_eq!(parsed, original);
    }
}
