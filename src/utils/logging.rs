use std::{
    fs::{self, OpenOptions},
    path::Path,
    sync::Mutex,
};
use tracing::Level;

/// Installs the process-wide fmt subscriber.
///
/// `debug` lowers the level from INFO to DEBUG. With a `log_file` the output
/// goes there (appending, parent directories created, no ANSI) instead of
/// stderr. Calling this twice is harmless: the second install is ignored.
pub fn init(debug: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    match log_file {
        Some(path) => {
            // Create log directory if it doesn't exist
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("logs/nested/signer.log");
        init(true, Some(&log)).unwrap();
        assert!(log.exists());
    }
}
