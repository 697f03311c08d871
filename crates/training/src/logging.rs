use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{metrics::EpochStats, TrainingError};

const LOG_FILENAME: &str = "log.txt";
const TENSORBOARD_DIR: &str = "tb";

/// Epoch-level metric sink. Only the main process with a configured run
/// directory actually writes; every other rank holds an inert sink so call
/// sites stay rank-agnostic. Each record lands in the TensorBoard event
/// file first (flushed), then as one JSON line appended to `log.txt`, so a
/// flushed event stream never trails the text log.
pub struct MetricSink {
    active: Option<ActiveSink>,
}

struct ActiveSink {
    log_path: PathBuf,
    tensorboard: TensorBoardWriter,
}

impl MetricSink {
    pub fn new(is_main: bool, run_dir: Option<&Path>) -> Result<Self, TrainingError> {
        let active = match run_dir {
            Some(dir) if is_main => {
                fs::create_dir_all(dir).map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to create run directory {}: {err}",
                        dir.display()
                    ))
                })?;
                Some(ActiveSink {
                    log_path: dir.join(LOG_FILENAME),
                    tensorboard: TensorBoardWriter::create(&dir.join(TENSORBOARD_DIR))?,
                })
            }
            _ => None,
        };
        Ok(Self { active })
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Records one epoch's statistics under `train_`-prefixed keys. An
    /// epoch with no statistics leaves both streams untouched.
    pub fn record(&mut self, epoch: usize, stats: &EpochStats) -> Result<(), TrainingError> {
        if stats.is_empty() {
            return Ok(());
        }
        let Some(sink) = self.active.as_mut() else {
            return Ok(());
        };

        for (name, value) in stats.iter() {
            sink.tensorboard
                .write_scalar(&format!("train_{name}"), epoch as i64, value)?;
        }
        sink.tensorboard.flush()?;

        let mut record = serde_json::Map::new();
        for (name, value) in stats.iter() {
            record.insert(format!("train_{name}"), serde_json::json!(value));
        }
        record.insert("epoch".to_string(), serde_json::json!(epoch));

        let line = serde_json::to_string(&serde_json::Value::Object(record))
            .map_err(|err| TrainingError::runtime(format!("failed to encode log record: {err}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink.log_path)
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to open {}: {err}",
                    sink.log_path.display()
                ))
            })?;
        writeln!(file, "{line}").map_err(|err| {
            TrainingError::runtime(format!(
                "failed to append to {}: {err}",
                sink.log_path.display()
            ))
        })
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
}

impl TensorBoardWriter {
    fn create(dir: &Path) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc.to_le_bytes()))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc.to_le_bytes()))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_stats() -> EpochStats {
        let mut stats = EpochStats::new();
        stats.insert("loss", 0.5);
        stats.insert("lr", 1e-3);
        stats
    }

    #[test]
    fn main_process_appends_one_json_line_per_epoch() {
        let tmp = tempdir().unwrap();
        let mut sink = MetricSink::new(true, Some(tmp.path())).unwrap();
        assert!(sink.is_active());

        sink.record(0, &sample_stats()).unwrap();
        sink.record(1, &sample_stats()).unwrap();

        let contents = fs::read_to_string(tmp.path().join(LOG_FILENAME)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["epoch"], 0);
        assert_eq!(first["train_loss"], 0.5);
        assert!(first.get("train_lr").is_some());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["epoch"], 1);
    }

    #[test]
    fn event_file_exists_after_record() {
        let tmp = tempdir().unwrap();
        let mut sink = MetricSink::new(true, Some(tmp.path())).unwrap();
        sink.record(0, &sample_stats()).unwrap();

        let tb_dir = tmp.path().join(TENSORBOARD_DIR);
        let events: Vec<_> = fs::read_dir(&tb_dir).unwrap().collect();
        assert_eq!(events.len(), 1);
        let event_file = events[0].as_ref().unwrap().path();
        assert!(fs::metadata(event_file).unwrap().len() > 0);
    }

    #[test]
    fn only_the_main_process_writes() {
        let tmp = tempdir().unwrap();
        for is_main in [true, false, false] {
            let mut sink = MetricSink::new(is_main, Some(tmp.path())).unwrap();
            sink.record(0, &sample_stats()).unwrap();
        }

        let contents = fs::read_to_string(tmp.path().join(LOG_FILENAME)).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn empty_stats_leave_both_streams_untouched() {
        let tmp = tempdir().unwrap();
        let mut sink = MetricSink::new(true, Some(tmp.path())).unwrap();
        sink.record(0, &EpochStats::new()).unwrap();
        assert!(!tmp.path().join(LOG_FILENAME).exists());
    }

    #[test]
    fn sink_without_run_directory_is_inert() {
        let mut sink = MetricSink::new(true, None).unwrap();
        assert!(!sink.is_active());
        sink.record(0, &sample_stats()).unwrap();
    }
}
