//! Minimal ANSI progress logging for the training loop.

use std::{
    fmt::Display,
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    time::Instant,
};

static QUIET: AtomicBool = AtomicBool::new(false);

pub fn ansi<T: Display, U: Display>(x: T, y: U) -> String {
    format!("\x1b[{y}m{x}\x1b[0m")
}

/// Silences all trainer output, for tests and embedding.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, SeqCst)
}

pub fn emit(line: &str) {
    if !QUIET.load(SeqCst) {
        println!("{line}");
    }
}

pub fn report_training_started() {
    emit(&ansi("Beginning Training", "34;1"));
}

pub fn report_minibatch(minibatch: usize, loss: f32, samples: usize, timer: &Instant) {
    let elapsed = timer.elapsed().as_secs_f32();
    let per_sec = samples as f32 / elapsed.max(f32::MIN_POSITIVE);

    emit(&format!(
        "minibatch {} | loss {} | {} samples | {} samples/sec",
        ansi(minibatch, 36),
        ansi(format!("{loss:.6}"), 36),
        ansi(samples, 36),
        ansi(format!("{per_sec:.0}"), 36),
    ));
}

pub fn report_training_finished(samples: usize, timer: &Instant) {
    let total = timer.elapsed().as_secs() as u32;
    let (hours, minutes, seconds) = seconds_to_hms(total);

    emit(&format!(
        "Finished: {} samples in {}h {}m {}s",
        ansi(samples, 36),
        ansi(hours, 36),
        ansi(minutes, 36),
        ansi(seconds, 36),
    ));
}

pub fn seconds_to_hms(mut seconds: u32) -> (u32, u32, u32) {
    let mut minutes = seconds / 60;
    let hours = minutes / 60;
    seconds -= minutes * 60;
    minutes -= hours * 60;

    (hours, minutes, seconds)
}
