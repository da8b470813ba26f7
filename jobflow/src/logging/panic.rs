use chrono::Local;
use std::{
    backtrace::Backtrace,
    fs::OpenOptions,
    io::Write,
    panic::{PanicHookInfo, take_hook},
    path::Path,
    thread,
};

use super::LOG_FILE_PREFIX;

/// Route panics through `tracing` before the default hook runs.
///
/// A panicking job task takes its worker down with it; the record lands in
/// the same daily file as the rest of the engine's output. Under
/// `panic = "abort"` the record is also appended to that file directly,
/// since the non-blocking writer does not get a chance to flush.
pub fn install_panic_hook(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = panic_record(panic_info);
            tracing::error!(target: "jobflow::panic", "{record}");

            if cfg!(panic = "abort") {
                let _ = append_record(&log_dir, &record);
            }
        }));

        previous_hook(panic_info);
    }));
}

fn append_record(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let path = log_dir.join(format!(
        "{}.{}",
        LOG_FILE_PREFIX,
        Local::now().format("%Y-%m-%d")
    ));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    format!(
        "PANIC thread={} location={} payload={}\nBacktrace:\n{}",
        thread_name,
        location,
        payload_message(panic_info.payload()),
        Backtrace::force_capture()
    )
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(payload_message(payload.as_ref()), "static message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("job {} exploded", 7));
        assert_eq!(payload_message(payload.as_ref()), "job 7 exploded");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(payload_message(payload.as_ref()), "<non-string payload>");
    }

    #[test]
    fn test_append_record_uses_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        append_record(dir.path(), "PANIC thread=main").unwrap();

        let expected = dir.path().join(format!(
            "jobflow.log.{}",
            Local::now().format("%Y-%m-%d")
        ));
        let contents = std::fs::read_to_string(expected).unwrap();
        assert_eq!(contents, "PANIC thread=main\n");
    }
}
