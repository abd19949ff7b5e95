//! Central kernel logger with optional in-memory capture.
//!
//! Installs a `log::Log` implementation that formats every record as
//! `[LEVEL target] message` and hands it to a sink installed at boot (the
//! serial port on hardware, a buffer in tests). Capture keeps a bounded
//! copy of recent lines so the console can dump them on request.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use crate::arch::Machine;

const CAPTURE_BUF_SIZE: usize = 16 * 1024;

/// Destination for formatted log lines.
pub type LogSink = fn(&str);

struct LogState {
    sink: Option<LogSink>,
    capture_enabled: bool,
    capture_overflow: bool,
    capture: String,
}

static STATE: Mutex<LogState> = Mutex::new(LogState {
    sink: None,
    capture_enabled: false,
    capture_overflow: false,
    capture: String::new(),
});

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = String::new();
        let _ = write!(line, "[{} {}] {}", record.level(), record.target(), record.args());

        // A log call from inside a locked section (e.g. a fault while logging)
        // must not deadlock; the line is dropped instead.
        let Some(mut state) = STATE.try_lock() else {
            return;
        };
        if let Some(sink) = state.sink {
            sink(&line);
        }
        if state.capture_enabled {
            let remaining = CAPTURE_BUF_SIZE.saturating_sub(state.capture.len());
            if line.len() + 1 <= remaining {
                state.capture.push_str(&line);
                state.capture.push('\n');
            } else {
                state.capture_overflow = true;
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger. Later calls only update the sink and level.
pub fn init(sink: LogSink, level: LevelFilter) {
    STATE.lock().sink = Some(sink);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Enables or disables the capture buffer and resets it.
pub fn set_capture_enabled(enabled: bool) {
    let mut state = STATE.lock();
    state.capture_enabled = enabled;
    state.capture.clear();
    state.capture_overflow = false;
}

/// Returns captured lines, optionally filtered to one target.
pub fn captured_lines(target: Option<&str>) -> Vec<String> {
    let state = STATE.lock();
    state
        .capture
        .lines()
        .filter(|line| match target {
            Some(t) => line_target(line) == Some(t),
            None => true,
        })
        .map(String::from)
        .collect()
}

/// Whether lines were dropped since capture was last reset.
pub fn capture_overflowed() -> bool {
    STATE.lock().capture_overflow
}

fn line_target(line: &str) -> Option<&str> {
    let inner = line.strip_prefix('[')?;
    let (head, _) = inner.split_once(']')?;
    head.split_once(' ').map(|(_, target)| target)
}

/// `fmt::Write` adapter that mirrors diagnostics to console and serial.
pub struct DiagnosticWriter<'a, M: Machine + ?Sized> {
    machine: &'a mut M,
}

impl<'a, M: Machine + ?Sized> DiagnosticWriter<'a, M> {
    pub fn new(machine: &'a mut M) -> Self {
        Self { machine }
    }
}

impl<M: Machine + ?Sized> fmt::Write for DiagnosticWriter<'_, M> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.machine.console_write(s.as_bytes());
        self.machine.serial_write(s.as_bytes());
        Ok(())
    }
}
