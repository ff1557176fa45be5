use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{render_line, LogLine, LogSink, SinkFormat};
use crate::Result;

/// Writes container output to stdout, either as plain text or one JSON
/// object per line.
#[derive(Debug)]
pub struct StdoutSink {
    name: String,
    format: SinkFormat,
}

impl StdoutSink {
    pub fn new(name_override: Option<String>, format: SinkFormat) -> Self {
        Self {
            name: name_override.unwrap_or_else(|| "stdout".to_string()),
            format,
        }
    }
}

impl LogSink for StdoutSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&self, line: &LogLine<'_>) -> Result<()> {
        let rendered = render_line(self.format, line)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", rendered)?;
        Ok(())
    }

    fn write_result(&self, result: &str) -> Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", result)?;
        out.flush()?;
        Ok(())
    }
}

/// Appends container output to a file, prefixed with the pod and container.
#[derive(Debug)]
pub struct FileSink {
    name: String,
    path: PathBuf,
    format: SinkFormat,
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>, format: SinkFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            name: format!("file:{}", path.display()),
            path,
            format,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&self, line: &LogLine<'_>) -> Result<()> {
        let rendered = match self.format {
            SinkFormat::Text => format!("[{}/{}] {}", line.pod, line.container, line.text),
            SinkFormat::Json => render_line(self.format, line)?,
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", rendered)?;
        Ok(())
    }

    fn write_result(&self, result: &str) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", result)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line<'a>(text: &'a str) -> LogLine<'a> {
        LogLine {
            pod: "boot-abc",
            container: "boot",
            text,
        }
    }

    #[test]
    fn test_stdout_sink_text() {
        let sink = StdoutSink::new(Some("test_sink".to_string()), SinkFormat::Text);
        assert_eq!(sink.name(), "test_sink");
        assert!(sink.write_line(&line("step 1 done")).is_ok());
        assert!(sink.write_result("POD RESULT: OK").is_ok());
    }

    #[test]
    fn test_stdout_sink_default_name() {
        let sink = StdoutSink::new(None, SinkFormat::Json);
        assert_eq!(sink.name(), "stdout");
        assert!(sink.write_line(&line("{\"nested\": true}")).is_ok());
    }

    #[test]
    fn test_file_sink_appends_prefixed_lines() {
        let path = std::env::temp_dir().join(format!("verify-sink-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let sink = FileSink::create(&path, SinkFormat::Text).unwrap();
        sink.write_line(&line("first")).unwrap();
        sink.write_result("POD RESULT: FAILED: disk full").unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(
            contents,
            "[boot-abc/boot] first\nPOD RESULT: FAILED: disk full\n"
        );
        let _ = std::fs::remove_file(&path);
    }
}
