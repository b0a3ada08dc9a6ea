use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes request/response/error sections to a per-request dump file,
/// flushing after every write so a crash mid-request doesn't lose the
/// tail.
pub struct DumpWriter {
    file: Option<std::fs::File>,
}

const SEPARATOR: &str = "================================================================================";

impl DumpWriter {
    /// Creates a new dump file under `dumps_dir` named
    /// `YYYY-MM-DD_HH-MM-SS-mmm_<model_name>.dump.txt`. Any failure to
    /// create the file degrades to a writer that silently drops every
    /// write, matching the original's best-effort diagnostic role.
    pub fn new(dumps_dir: &str, model_name: Option<&str>) -> Self {
        let path = Self::generate_filename(dumps_dir, model_name);
        let file = match std::fs::File::create(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to create dump file");
                None
            }
        };
        Self { file }
    }

    fn generate_filename(dumps_dir: &str, model_name: Option<&str>) -> PathBuf {
        let now = chrono::Local::now();
        let timestamp = now.format("%Y-%m-%d_%H-%M-%S");
        let millis = now.timestamp_subsec_millis();
        let model = model_name.unwrap_or("unknown");
        Path::new(dumps_dir).join(format!("{timestamp}-{millis:03}_{model}.dump.txt"))
    }

    pub fn write_request(&mut self, request_text: &str) {
        self.write_section("REQUEST", request_text);
    }

    pub fn write_response(&mut self, response_text: &str) {
        self.write_section("RESPONSE", response_text);
    }

    fn write_section(&mut self, title: &str, text: &str) {
        let Some(file) = self.file.as_mut() else { return };
        let _ = writeln!(file, "{SEPARATOR}\n{title}\n{SEPARATOR}");
        let _ = file.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            let _ = writeln!(file);
        }
        let _ = writeln!(file, "{SEPARATOR}\n");
        let _ = file.flush();
    }

    pub fn write_response_start(&mut self) {
        let Some(file) = self.file.as_mut() else { return };
        let _ = writeln!(file, "{SEPARATOR}\nRESPONSE (STREAMING)\n{SEPARATOR}");
        let _ = file.flush();
    }

    pub fn write_response_chunk(&mut self, chunk: &[u8]) {
        let Some(file) = self.file.as_mut() else { return };
        let _ = file.write_all(&String::from_utf8_lossy(chunk).into_owned().into_bytes());
        let _ = file.flush();
    }

    pub fn write_response_end(&mut self) {
        let Some(file) = self.file.as_mut() else { return };
        let _ = writeln!(file, "\n{SEPARATOR}\n");
        let _ = file.flush();
    }

    pub fn write_error(&mut self, error: &dyn std::error::Error) {
        let Some(file) = self.file.as_mut() else { return };
        let _ = writeln!(file, "{SEPARATOR}\nERROR\n{SEPARATOR}");
        let _ = writeln!(file, "Error: {error}");
        let _ = writeln!(file, "{SEPARATOR}\n");
        let _ = file.flush();
    }
}

/// Removes every `*.dump.txt` file under `dumps_dir`, used when
/// `server.clear_dumps_on_start` is set. Best-effort: logs and continues
/// past individual file-removal errors.
pub fn clear_dumps(dumps_dir: &str) {
    let entries = match std::fs::read_dir(dumps_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, dumps_dir, "failed to list dumps directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("txt")
            && path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(".dump.txt"))
        {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(error = %e, path = %path.display(), "failed to remove dump file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_request_and_response_sections() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap();
        let mut dw = DumpWriter::new(dir_path, Some("alpha"));
        dw.write_request("{\"model\":\"alpha\"}");
        dw.write_response("{\"choices\":[]}");

        let mut files: Vec<_> = std::fs::read_dir(dir_path).unwrap().collect();
        assert_eq!(files.len(), 1);
        let contents = std::fs::read_to_string(files.remove(0).unwrap().path()).unwrap();
        assert!(contents.contains("REQUEST"));
        assert!(contents.contains("RESPONSE"));
        assert!(contents.contains("alpha"));
    }

    #[test]
    fn clear_dumps_removes_only_dump_files() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("2026-01-01_00-00-00-000_alpha.dump.txt"), "x").unwrap();
        std::fs::write(dir.path().join("keepme.txt"), "x").unwrap();

        clear_dumps(dir_path);

        let remaining: Vec<_> = std::fs::read_dir(dir_path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["keepme.txt"]);
    }
}
