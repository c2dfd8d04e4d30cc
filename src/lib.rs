pub mod agent_core;
pub mod inference;

use std::path::{Path, PathBuf};

/// Return the platform-standard data directory for the assistant.
///
/// - macOS: `~/Library/Application Support/com.roro.ai/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.roro.ai\`
/// - Linux: `$XDG_DATA_HOME/com.roro.ai/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.roro-ai/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.roro.ai");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".roro-ai")
}

/// Path of the SQLite preference store (creates the data directory).
pub fn preferences_db_path() -> std::io::Result<String> {
    db_path_in(&data_dir())
}

fn db_path_in(dir: &Path) -> std::io::Result<String> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.join("preferences.db").to_string_lossy().into_owned())
}

/// Initialize the tracing subscriber, writing to `assistant.log` in the data
/// directory.
///
/// On each startup:
/// 1. Rotates existing logs (assistant.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh assistant.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
pub fn init_tracing() -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("assistant.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roro_ai=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== roro-ai starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `assistant.log` → `assistant.log.1` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer around `std::fs::File` that flushes after every write, so log
/// lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("assistant.log");

        for generation in 0..5 {
            rotate_log_file(&base, 3);
            std::fs::write(&base, format!("run {generation}")).unwrap();
        }

        assert_eq!(std::fs::read_to_string(&base).unwrap(), "run 4");
        let rotated = |n: u32| std::fs::read_to_string(format!("{}.{n}", base.display()));
        assert_eq!(rotated(1).unwrap(), "run 3");
        assert_eq!(rotated(2).unwrap(), "run 2");
        assert_eq!(rotated(3).unwrap(), "run 1");
        assert!(rotated(4).is_err(), "run 0 was dropped");
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_db_path_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("nested").join("data");

        let path = db_path_in(&dir).unwrap();
        assert!(dir.is_dir());
        assert!(path.ends_with("preferences.db"));
    }

    #[test]
    fn test_db_path_reports_unusable_directory() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        assert!(db_path_in(&blocker.join("data")).is_err());
    }

    #[test]
    fn test_data_dir_is_app_scoped() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name == "com.roro.ai" || name == ".roro-ai");
    }
}
