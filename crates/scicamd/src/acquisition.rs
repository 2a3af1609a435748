//! Exposure sequence loop, run on its own thread for each sequence.

use crate::camera::{lock, CameraError, CameraShared};
use crate::framebuffer::{FramePool, FrameSlot};
use crate::output::{FrameJob, OutputQueue};
use chrono::Utc;
use scicam_core::{Config, FrameMetadata};
use scicam_hw::serial::{query_parsed, send};
use scicam_hw::SENSOR_CLOCK_HZ;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Clock counts between the end of an exposure and the next frame.
const EXPOSURE_GAP_COUNTS: u64 = 1000;
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const SLOT_WAIT: Duration = Duration::from_millis(10);

pub struct SequenceContext {
    pub config: Arc<Config>,
    pub shared: Arc<CameraShared>,
    pub output: OutputQueue,
}

impl SequenceContext {
    fn stop_requested(&self) -> bool {
        self.shared.stop_requested() || self.output.stop_requested()
    }
}

struct SensorTiming {
    frame_period: f64,
    buffer_count: usize,
    width: usize,
    height: usize,
}

pub fn run_exposure_sequence(ctx: SequenceContext, quiet: bool) {
    let log_name = ctx.config.log_name.clone();
    let mut pool = None;

    if let Err(e) = acquire(&ctx, &mut pool) {
        tracing::error!(camera = %log_name, error = %e, "exposure sequence failed");
    }

    let stopped = ctx.shared.with_grabber(|g| {
        g.stop_live();
        send(g, "SENS:TRIG OFF")?;
        Ok(())
    });
    if let Err(e) = stopped {
        tracing::warn!(camera = %log_name, error = %e, "failed to disable trigger");
    }

    let counter = lock(&ctx.shared.state).counter.clone();
    if let Err(e) = counter.save(&ctx.config.expcount_path) {
        tracing::error!(camera = %log_name, error = %e, "failed to save exposure counter");
    }

    // Wait for the workers to finish with every buffer
    if let Some(pool) = pool {
        pool.drain();
    }

    if !quiet {
        tracing::info!(camera = %log_name, "Exposure sequence complete");
    }
    // Clear before the stop flag, or status briefly reads Acquiring again
    ctx.shared.acquiring.store(false, Ordering::SeqCst);
    ctx.shared.stop_acquisition.store(false, Ordering::SeqCst);
}

/// Program the sensor timing and sync the camera clock.
fn configure_sensor(ctx: &SequenceContext) -> Result<SensorTiming, CameraError> {
    let exposure_time = lock(&ctx.shared.state).exposure_time;
    let exposure_counts = (exposure_time * SENSOR_CLOCK_HZ).round() as u64;

    ctx.shared.with_grabber(|g| {
        // The frame period must be raised before a longer exposure is accepted
        let current: u64 = query_parsed(g, "SENS:EXPPER?")?;
        if exposure_counts > current {
            let minimum: u64 = query_parsed(g, "SENS:FRAMEPER:MIN?")?;
            let period = (exposure_counts + EXPOSURE_GAP_COUNTS).max(minimum);
            send(g, &format!("SENS:FRAMEPER {period}"))?;
        }
        send(g, &format!("SENS:EXPPER {exposure_counts}"))?;

        let period: u64 = query_parsed(g, "SENS:FRAMEPER:MIN?")?;
        send(g, &format!("SENS:FRAMEPER {period}"))?;

        let now = Utc::now().format("%Y:%m:%d:%H:%M:%S");
        send(g, &format!("TIME {now}"))?;

        Ok(SensorTiming {
            frame_period: period as f64 / SENSOR_CLOCK_HZ,
            buffer_count: g.buffer_count(),
            width: g.image_width(),
            height: g.image_height(),
        })
    })
}

/// Size the slot pool so it never holds more frames than the grabber ring.
fn build_pool(ctx: &SequenceContext, timing: &SensorTiming) -> FramePool {
    let pixels = timing.width * timing.height;
    let frame_bytes = 2 * pixels;
    let available = ctx.config.framebuffer_bytes / frame_bytes.max(1);
    if available != timing.buffer_count {
        tracing::warn!(
            camera = %ctx.config.log_name,
            optimal = timing.buffer_count * frame_bytes,
            "framebuffer_bytes should be set to {} for optimal performance",
            timing.buffer_count * frame_bytes
        );
    }
    let pool = FramePool::new(available.min(timing.buffer_count).max(1), pixels);
    tracing::debug!(
        camera = %ctx.config.log_name,
        slots = pool.slot_count(),
        pixels = pool.pixels_per_slot(),
        "framebuffer allocated"
    );
    pool
}

/// Block until a free slot is available or the sequence is stopped.
fn take_slot(ctx: &SequenceContext, pool: &FramePool) -> Option<FrameSlot> {
    loop {
        if ctx.stop_requested() {
            return None;
        }
        if let Some(slot) = pool.take_timeout(SLOT_WAIT) {
            return Some(slot);
        }
    }
}

fn acquire(ctx: &SequenceContext, pool_out: &mut Option<FramePool>) -> Result<(), CameraError> {
    let timing = configure_sensor(ctx)?;
    let pool = pool_out.insert(build_pool(ctx, &timing));

    let mut last_buffer = ctx.shared.with_grabber(|g| {
        let last = g.captured_buffer();
        for buffer in 1..=g.buffer_count() {
            g.queue_live(buffer)?;
        }
        send(g, "SENS:TRIG ON")?;
        Ok(last)
    })?;

    while !ctx.stop_requested() {
        lock(&ctx.shared.state).exposure_start = Some(Instant::now());

        let Some(mut slot) = take_slot(ctx, pool) else {
            break;
        };

        let mut buffer = last_buffer;
        while buffer == last_buffer && !ctx.stop_requested() {
            std::thread::sleep(POLL_INTERVAL);
            buffer = ctx.shared.with_grabber(|g| Ok(g.captured_buffer()))?;
        }
        if ctx.stop_requested() {
            break;
        }
        last_buffer = buffer;

        let (field, read) = ctx.shared.with_grabber(|g| {
            let field = g.field_count(buffer);
            let read = g.read_buffer(buffer, slot.pixels_mut());
            if let Err(e) = g.queue_live(buffer) {
                tracing::warn!(camera = %ctx.config.log_name, buffer, error = %e, "failed to requeue buffer");
            }
            Ok((field, read))
        })?;
        if let Err(e) = read {
            tracing::error!(camera = %ctx.config.log_name, buffer, error = %e, "failed to read frame");
            continue;
        }
        let read_end_time = Utc::now();

        let metadata = {
            let mut state = lock(&ctx.shared.state);
            let metadata = FrameMetadata {
                width: timing.width,
                height: timing.height,
                exposure: state.exposure_time,
                frame_period: timing.frame_period,
                field,
                read_end_time,
                cooler: state.cooler,
                camera: Arc::clone(&state.info),
                exposure_count: state.counter.count,
                exposure_count_reference: state.counter.reference.clone(),
            };
            state.counter.count += 1;
            state.sequence_frame_count += 1;

            let limit = state.sequence_frame_limit;
            if limit > 0 && state.sequence_frame_count >= limit {
                ctx.shared.stop_acquisition.store(true, Ordering::SeqCst);
            }
            metadata
        };

        if let Err(e) = ctx.output.submit(FrameJob { slot, metadata }) {
            tracing::error!(camera = %ctx.config.log_name, error = %e, "failed to queue frame");
            break;
        }
    }
    Ok(())
}
