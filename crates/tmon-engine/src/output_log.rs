use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tmon_core::config::ActionOutputLimits;
use tokio::sync::broadcast;
use tracing::debug;

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Lines {
    entries: VecDeque<(usize, String)>,
    total_bytes: usize,
}

/// Bounded in-memory transcript of action output, mirrored line by line to a file.
#[derive(Debug)]
pub struct ActionOutputLog {
    limits: ActionOutputLimits,
    mirror_path: Option<PathBuf>,
    lines: Mutex<Lines>,
    sender: broadcast::Sender<String>,
}

impl ActionOutputLog {
    pub fn new(limits: ActionOutputLimits, mirror_path: Option<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            limits: ActionOutputLimits::new(limits.max_lines, limits.max_bytes),
            mirror_path,
            lines: Mutex::new(Lines::default()),
            sender,
        }
    }

    pub fn limits(&self) -> ActionOutputLimits {
        self.limits
    }

    pub fn mirror_path(&self) -> Option<&Path> {
        self.mirror_path.as_deref()
    }

    /// Appends `[stream] text`, evicting the oldest lines past either limit. Returns the
    /// snapshot after eviction and the formatted line.
    pub fn append(&self, stream: &str, text: &str) -> (String, String) {
        let line = format!("[{stream}] {text}")
            .trim_end_matches(['\r', '\n'])
            .to_string();
        let size = line.len() + 1;
        // The mirror and subscribers see lines in the same order as memory.
        let mut lines = self.lock();
        lines.entries.push_back((size, line.clone()));
        lines.total_bytes += size;
        while lines.entries.len() > self.limits.max_lines
            || lines.total_bytes > self.limits.max_bytes
        {
            match lines.entries.pop_front() {
                Some((removed, _)) => lines.total_bytes -= removed,
                None => break,
            }
        }
        self.mirror(&line);
        let _ = self.sender.send(line.clone());
        (join(&lines.entries), line)
    }

    pub fn snapshot(&self) -> String {
        join(&self.lock().entries)
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    /// Empties memory and truncates the mirror file.
    pub fn clear(&self) {
        let mut lines = self.lock();
        lines.entries.clear();
        lines.total_bytes = 0;
        if let Some(path) = &self.mirror_path {
            if path.exists() {
                if let Err(err) = fs::write(path, b"") {
                    debug!(event = "action_output_truncate_failed", path = %path.display(), error = %err);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    fn mirror(&self, line: &str) {
        let Some(path) = &self.mirror_path else {
            return;
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")
        };
        if let Err(err) = write() {
            debug!(event = "action_output_mirror_failed", path = %path.display(), error = %err);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lines> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn join(entries: &VecDeque<(usize, String)>) -> String {
    entries
        .iter()
        .map(|(_, line)| line.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Mirror file name component for a target id.
pub fn sanitize_file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        "target".to_string()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn formats_lines_with_stream_prefix() {
        let log = ActionOutputLog::new(ActionOutputLimits::default(), None);
        let (snapshot, line) = log.append("stdout", "hello\r\n");
        assert_eq!(line, "[stdout] hello");
        assert_eq!(snapshot, "[stdout] hello");
        log.append("system", "done");
        assert_eq!(log.snapshot(), "[stdout] hello\n[system] done");
    }

    #[test]
    fn evicts_oldest_lines_past_line_limit() {
        let log = ActionOutputLog::new(ActionOutputLimits::new(2, 1024), None);
        for index in 0..5 {
            log.append("stdout", &format!("line {index}"));
        }
        assert_eq!(log.lines(), vec!["[stdout] line 3", "[stdout] line 4"]);
    }

    #[test]
    fn evicts_by_bytes_counting_newlines() {
        let log = ActionOutputLog::new(ActionOutputLimits::new(1000, 1024), None);
        let text = "x".repeat(500);
        for _ in 0..3 {
            log.append("o", &text);
        }
        // each line is "[o] " + 500 bytes + 1 newline = 505
        assert_eq!(log.lines().len(), 2);
        assert_eq!(log.total_bytes(), 1010);
        assert!(log.total_bytes() <= log.limits().max_bytes);
    }

    #[test]
    fn mirrors_to_file_and_clear_truncates_it() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("action-output").join("alpha.log");
        let log = ActionOutputLog::new(ActionOutputLimits::default(), Some(path.clone()));
        log.append("stdout", "one");
        log.append("stderr", "two");
        let mirrored = fs::read_to_string(&path).expect("mirror");
        assert_eq!(mirrored, "[stdout] one\n[stderr] two\n");

        log.clear();
        assert_eq!(log.snapshot(), "");
        assert_eq!(fs::read_to_string(&path).expect("mirror"), "");
    }

    #[test]
    fn mirror_matches_memory_under_concurrent_append_and_clear() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("alpha.log");
        let log = std::sync::Arc::new(ActionOutputLog::new(
            ActionOutputLimits::default(),
            Some(path.clone()),
        ));

        let mut workers = Vec::new();
        for worker in 0..4 {
            let log = log.clone();
            workers.push(std::thread::spawn(move || {
                for index in 0..200 {
                    log.append("stdout", &format!("w{worker} line {index}"));
                }
            }));
        }
        let clearer = {
            let log = log.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    log.clear();
                    std::thread::yield_now();
                }
            })
        };
        for worker in workers {
            worker.join().expect("writer");
        }
        clearer.join().expect("clearer");

        let snapshot = log.snapshot();
        let expected = if snapshot.is_empty() {
            String::new()
        } else {
            format!("{snapshot}\n")
        };
        let mirrored = fs::read_to_string(&path).unwrap_or_default();
        assert_eq!(mirrored, expected);
    }

    #[tokio::test]
    async fn subscribers_receive_formatted_lines() {
        let log = ActionOutputLog::new(ActionOutputLimits::default(), None);
        let mut rx = log.subscribe();
        log.append("system", "running build");
        assert_eq!(rx.recv().await.expect("line"), "[system] running build");
    }

    #[test]
    fn sanitizes_target_ids_for_file_names() {
        assert_eq!(sanitize_file_stem("svc/alpha beta"), "svc_alpha_beta");
        assert_eq!(sanitize_file_stem(".."), "target");
        assert_eq!(sanitize_file_stem("app-1.v2"), "app-1.v2");
    }
}
