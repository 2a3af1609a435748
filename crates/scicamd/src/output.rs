//! Output workers: encode frames as FITS, save them and hand them to the
//! pipeline.

use crate::framebuffer::FrameSlot;
use crate::pipeline::{FrameHandover, HandoverError};
use scicam_core::fits::{self, FitsError};
use scicam_core::header::frame_header;
use scicam_core::timestamp::{decode_frame_timestamp, TimestampError};
use scicam_core::{Config, FrameMetadata};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("invalid frame timestamp: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("failed to encode frame: {0}")]
    Fits(#[from] FitsError),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("handover failed: {0}")]
    Handover(#[from] HandoverError),
    #[error("output workers have exited")]
    QueueClosed,
    #[error("failed to spawn output worker: {0}")]
    Spawn(std::io::Error),
}

/// A captured frame waiting to be written.
pub struct FrameJob {
    pub slot: FrameSlot,
    pub metadata: FrameMetadata,
}

/// What the workers need from the daemon config.
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub log_name: String,
    pub camera_id: String,
    pub output_path: PathBuf,
    pub output_prefix: String,
    pub header_card_capacity: usize,
    pub workers: usize,
}

impl OutputSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            log_name: config.log_name.clone(),
            camera_id: config.camera_id.clone(),
            output_path: config.output_path.clone(),
            output_prefix: config.output_prefix.clone(),
            header_card_capacity: config.header_card_capacity,
            workers: config.worker_processes,
        }
    }

    /// `<prefix>-<count:08>.fits`
    pub fn filename(&self, exposure_count: u64) -> String {
        format!("{}-{:08}.fits", self.output_prefix, exposure_count)
    }
}

/// Producer side of the worker queue, plus the signal the workers raise
/// when a frame could not be processed.
#[derive(Clone)]
pub struct OutputQueue {
    tx: Sender<FrameJob>,
    stop_signal: Arc<AtomicBool>,
}

impl OutputQueue {
    pub fn submit(&self, job: FrameJob) -> Result<(), OutputError> {
        self.tx.send(job).map_err(|_| OutputError::QueueClosed)
    }

    /// True once a worker has failed to save or hand over a frame.
    pub fn stop_requested(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    pub fn clear_stop(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }
}

pub struct OutputPool {
    queue: OutputQueue,
    workers: Vec<JoinHandle<()>>,
}

impl OutputPool {
    pub fn spawn(
        settings: OutputSettings,
        handover: Arc<dyn FrameHandover>,
    ) -> Result<Self, OutputError> {
        let (tx, rx) = mpsc::channel::<FrameJob>();
        let rx = Arc::new(Mutex::new(rx));
        let stop_signal = Arc::new(AtomicBool::new(false));
        let settings = Arc::new(settings);

        let mut workers = Vec::with_capacity(settings.workers);
        for index in 0..settings.workers.max(1) {
            let rx = Arc::clone(&rx);
            let settings = Arc::clone(&settings);
            let handover = Arc::clone(&handover);
            let stop_signal = Arc::clone(&stop_signal);
            let worker = std::thread::Builder::new()
                .name(format!("scicam-output-{index}"))
                .spawn(move || worker_loop(&rx, &settings, handover.as_ref(), &stop_signal))
                .map_err(OutputError::Spawn)?;
            workers.push(worker);
        }

        tracing::debug!(
            camera = %settings.log_name,
            workers = workers.len(),
            "output workers started"
        );
        Ok(Self {
            queue: OutputQueue { tx, stop_signal },
            workers,
        })
    }

    pub fn queue(&self) -> OutputQueue {
        self.queue.clone()
    }

    /// Wait for the workers to finish. They exit once every [`OutputQueue`]
    /// clone has been dropped and the queue is empty.
    pub fn join(self) {
        drop(self.queue);
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("output worker panicked");
            }
        }
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<FrameJob>>,
    settings: &OutputSettings,
    handover: &dyn FrameHandover,
    stop_signal: &AtomicBool,
) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(job) = job else {
            break;
        };

        if let Err(e) = process_frame(job, settings, handover) {
            stop_signal.store(true, Ordering::SeqCst);
            tracing::error!(camera = %settings.log_name, error = %e, "failed to process frame");
        }
    }
}

/// Encode, save and hand over one frame.
pub fn process_frame(
    job: FrameJob,
    settings: &OutputSettings,
    handover: &dyn FrameHandover,
) -> Result<(), OutputError> {
    let FrameJob { slot, metadata } = job;
    // Release the slot as soon as the pixels are encoded.
    let encoded = encode_frame(slot.pixels(), &metadata, settings);
    drop(slot);
    let data = encoded?;

    let filename = settings.filename(metadata.exposure_count);
    let path = settings.output_path.join(&filename);
    write_atomic(&path, &data)?;
    tracing::info!(camera = %settings.log_name, file = %filename, "saved frame");

    handover.notify_frame(&settings.camera_id, &filename)?;
    Ok(())
}

fn encode_frame(
    pixels: &[u16],
    metadata: &FrameMetadata,
    settings: &OutputSettings,
) -> Result<Vec<u8>, OutputError> {
    let first_row = &pixels[..metadata.width.min(pixels.len())];
    let date_start = decode_frame_timestamp(first_row)?;
    let cards = frame_header(metadata, &settings.camera_id, date_start);
    let data = fits::encode_image(
        metadata.width,
        metadata.height,
        pixels,
        &cards,
        settings.header_card_capacity,
    )?;

    tracing::trace!(
        camera = %settings.log_name,
        exposure_count = metadata.exposure_count,
        start = %date_start,
        "encoded frame"
    );
    Ok(data)
}

/// Write to `<path>.tmp` and rename, so readers never see a partial file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), OutputError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|source| OutputError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::FramePool;
    use chrono::{TimeZone, Utc};
    use scicam_core::fits::BLOCK_LENGTH;
    use scicam_core::timestamp::encode_frame_timestamp;
    use scicam_core::{CameraInfo, CoolerTelemetry};
    use std::time::Duration;

    const WIDTH: usize = 16;
    const HEIGHT: usize = 4;

    #[derive(Default)]
    struct RecordingHandover {
        frames: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl FrameHandover for RecordingHandover {
        fn notify_frame(&self, camera_id: &str, filename: &str) -> Result<(), HandoverError> {
            if self.fail {
                return Err(HandoverError::Rejected("pipeline offline".into()));
            }
            self.frames
                .lock()
                .unwrap()
                .push((camera_id.to_string(), filename.to_string()));
            Ok(())
        }
    }

    fn settings(dir: &Path) -> OutputSettings {
        OutputSettings {
            log_name: "test".into(),
            camera_id: "CAM1".into(),
            output_path: dir.to_path_buf(),
            output_prefix: "cam1".into(),
            header_card_capacity: 144,
            workers: 2,
        }
    }

    fn metadata(exposure_count: u64) -> FrameMetadata {
        FrameMetadata {
            width: WIDTH,
            height: HEIGHT,
            exposure: 1.0,
            frame_period: 1.0,
            field: 1,
            read_end_time: Utc::now(),
            cooler: CoolerTelemetry::new(-40.0),
            camera: Arc::new(CameraInfo::default()),
            exposure_count,
            exposure_count_reference: "2024-01-01".into(),
        }
    }

    fn job(pool: &FramePool, exposure_count: u64) -> FrameJob {
        let mut slot = pool.take_timeout(Duration::from_secs(1)).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        encode_frame_timestamp(start, &mut slot.pixels_mut()[..WIDTH]).unwrap();
        FrameJob {
            slot,
            metadata: metadata(exposure_count),
        }
    }

    #[test]
    fn test_filename_format() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(settings(dir.path()).filename(42), "cam1-00000042.fits");
    }

    #[test]
    fn test_process_frame_writes_fits() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let handover = RecordingHandover::default();
        let pool = FramePool::new(1, WIDTH * HEIGHT);

        process_frame(job(&pool, 7), &settings, &handover).unwrap();

        let path = dir.path().join("cam1-00000007.fits");
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() % BLOCK_LENGTH, 0);
        assert!(data.starts_with(b"SIMPLE  ="));
        let header = String::from_utf8_lossy(&data[..BLOCK_LENGTH * 2]);
        assert!(header.contains("DATE-OBS= '2024-03-01T12:00:00.000000'"));
        assert!(!dir.path().join("cam1-00000007.fits.tmp").exists());

        let frames = handover.frames.lock().unwrap();
        assert_eq!(
            frames.as_slice(),
            &[("CAM1".to_string(), "cam1-00000007.fits".to_string())]
        );

        // Slot went back to the pool.
        drop(frames);
        pool.drain();
    }

    #[test]
    fn test_handover_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let handover = RecordingHandover {
            fail: true,
            ..Default::default()
        };
        let pool = FramePool::new(1, WIDTH * HEIGHT);

        let result = process_frame(job(&pool, 1), &settings(dir.path()), &handover);
        assert!(matches!(result, Err(OutputError::Handover(_))));
        // The file is still saved for manual recovery.
        assert!(dir.path().join("cam1-00000001.fits").exists());
    }

    #[test]
    fn test_workers_process_queue_and_raise_stop_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.output_path = dir.path().join("missing");

        let handover = Arc::new(RecordingHandover::default());
        let output = OutputPool::spawn(settings, handover.clone()).unwrap();
        let queue = output.queue();
        let pool = FramePool::new(2, WIDTH * HEIGHT);

        assert!(!queue.stop_requested());
        queue.submit(job(&pool, 3)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !queue.stop_requested() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.stop_requested());
        assert!(handover.frames.lock().unwrap().is_empty());

        queue.clear_stop();
        assert!(!queue.stop_requested());
        drop(queue);
        output.join();
        pool.drain();
    }

    #[test]
    fn test_workers_save_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let handover = Arc::new(RecordingHandover::default());
        let output = OutputPool::spawn(settings(dir.path()), handover.clone()).unwrap();
        let queue = output.queue();
        let pool = FramePool::new(2, WIDTH * HEIGHT);

        for count in 0..5 {
            queue.submit(job(&pool, count)).unwrap();
        }
        drop(queue);
        output.join();
        pool.drain();

        let mut frames: Vec<String> = handover
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name)| name.clone())
            .collect();
        frames.sort();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], "cam1-00000000.fits");
        assert_eq!(frames[4], "cam1-00000004.fits");
    }
}
