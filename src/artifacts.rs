use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::Result;
use crate::logging::ScanLogger;
use crate::types::ScanTask;

#[derive(Debug, Clone)]
pub struct TempArtifacts {
    root: PathBuf,
    logger: ScanLogger,
}

impl TempArtifacts {
    pub fn new(root: impl Into<PathBuf>, logger: ScanLogger) -> Self {
        Self {
            root: root.into(),
            logger: logger.scoped("grabscan::artifacts"),
        }
    }

    /// Returns a fresh path `<root>/<batch>/<task>_<port>_<unique>.<purpose>`.
    /// The parent directory is created; the file itself is not.
    pub fn allocate(&self, task: &ScanTask, port: u16, purpose: &str) -> Result<PathBuf> {
        let dir = self.root.join(sanitize(&task.batch_id));
        fs::create_dir_all(&dir)?;
        let name = format!(
            "{}_{}_{}.{}",
            sanitize(&task.task_id),
            port,
            Uuid::new_v4().simple(),
            purpose
        );
        let path = dir.join(name);
        self.logger.trace(format_args!(
            "[artifacts] allocated: task_id={} path={}",
            task.task_id,
            path.display()
        ));
        Ok(path)
    }

    /// Removes `path` if it exists. Missing files are not an error.
    pub fn release(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {
                self.logger.trace(format_args!("[artifacts] released: path={}", path.display()));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                self.logger.error(format_args!(
                    "[artifacts] release_failed: path={} error={}",
                    path.display(),
                    e
                ));
            }
        }
    }

    pub fn guard(&self) -> ArtifactGuard {
        ArtifactGuard {
            artifacts: self.clone(),
            paths: Vec::new(),
        }
    }
}

/// Owns every path handed out during one pipeline run and removes them
/// all when dropped.
#[derive(Debug)]
pub struct ArtifactGuard {
    artifacts: TempArtifacts,
    paths: Vec<PathBuf>,
}

impl ArtifactGuard {
    pub fn allocate(&mut self, task: &ScanTask, port: u16, purpose: &str) -> Result<PathBuf> {
        let path = self.artifacts.allocate(task, port, purpose)?;
        self.track(&path);
        Ok(path)
    }

    pub fn track(&mut self, path: &Path) {
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_path_buf());
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            self.artifacts.release(&path);
        }
    }
}

/// Writes one host per line, flushed and synced before returning.
pub fn write_host_list(path: &Path, hosts: &[String]) -> Result<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for host in hosts {
        writeln!(writer, "{}", host)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}
