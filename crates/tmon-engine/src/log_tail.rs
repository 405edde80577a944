use globset::GlobBuilder;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tmon_core::config::{LogStreamConfig, TextEncoding};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SEED_CHUNK_BYTES: u64 = 8192;
const SEED_MAX_BYTES: usize = 2 * 1024 * 1024;
const TRUNCATED_MARKER: &str = "...[truncated]";

/// Latest published view of one stream: a `(stream=.. file=..)` header plus buffered lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailRender {
    pub stream: String,
    pub path: String,
    pub text: String,
}

impl TailRender {
    fn new(stream: &str, path: &str, content: &str) -> Self {
        let mut text = format!("(stream={stream} file={path})");
        if !content.is_empty() {
            text.push('\n');
            text.push_str(content);
        }
        Self {
            stream: stream.to_string(),
            path: path.to_string(),
            text,
        }
    }

    pub fn pending(config: &LogStreamConfig) -> Self {
        Self::new(&config.stream, &config.glob, "")
    }
}

fn has_glob_meta(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

/// The file a glob currently points at: the literal path when there are no wildcards,
/// otherwise the match with the newest mtime (ties go to the greatest path).
pub fn resolve_latest_file(expression: &str) -> Option<PathBuf> {
    let expression = expression.trim();
    if expression.is_empty() {
        return None;
    }
    if !has_glob_meta(expression) {
        let candidate = PathBuf::from(expression);
        return candidate.is_file().then_some(candidate);
    }

    let matcher = GlobBuilder::new(expression)
        .literal_separator(true)
        .build()
        .ok()?
        .compile_matcher();

    let pattern = Path::new(expression);
    let mut root = PathBuf::new();
    let mut remaining = 0usize;
    let mut recursive = false;
    for component in pattern.components() {
        let text = component.as_os_str().to_string_lossy();
        if remaining == 0 && !has_glob_meta(&text) {
            root.push(component.as_os_str());
            continue;
        }
        if text.contains("**") {
            recursive = true;
        }
        if matches!(component, Component::Normal(_)) {
            remaining += 1;
        }
    }
    let relative = root.as_os_str().is_empty();
    let walk_root = if relative { PathBuf::from(".") } else { root };

    let mut walker = WalkDir::new(&walk_root).min_depth(1);
    if !recursive {
        walker = walker.max_depth(remaining);
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in walker.into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = if relative {
            entry
                .path()
                .strip_prefix(".")
                .unwrap_or(entry.path())
                .to_path_buf()
        } else {
            entry.path().to_path_buf()
        };
        if !matcher.is_match(&path) {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|meta| meta.modified().ok()) else {
            continue;
        };
        let newer = match &newest {
            None => true,
            Some((best_time, best_path)) => (modified, &path) > (*best_time, best_path),
        };
        if newer {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| path)
}

/// Last `max_lines` lines of a file, found by scanning backwards in 8 KiB chunks (at most
/// 2 MiB). Blank lines at either end are dropped.
pub fn tail_lines(path: &Path, max_lines: usize, encoding: TextEncoding) -> io::Result<Vec<String>> {
    let wanted = max_lines.max(1);
    let mut file = File::open(path)?;
    let mut position = file.seek(SeekFrom::End(0))?;
    let mut buffer: Vec<u8> = Vec::new();

    while position > 0
        && buffer.iter().filter(|byte| **byte == b'\n').count() <= wanted
        && buffer.len() < SEED_MAX_BYTES
    {
        let read_size = SEED_CHUNK_BYTES.min(position);
        position -= read_size;
        file.seek(SeekFrom::Start(position))?;
        let mut chunk = vec![0u8; read_size as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buffer);
        buffer = chunk;
    }

    let text = encoding.decode(&buffer);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if lines.len() > wanted {
        lines.drain(..lines.len() - wanted);
    }
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    while lines.first().is_some_and(|line| line.trim().is_empty()) {
        lines.remove(0);
    }
    Ok(lines)
}

/// Incremental reader for one log stream. Each [`LogTailer::tick`] follows file rotation
/// and growth and returns a render only when it differs from the last one.
#[derive(Debug)]
pub struct LogTailer {
    config: LogStreamConfig,
    buffer: VecDeque<String>,
    active_file: Option<PathBuf>,
    offset: u64,
    remainder: Vec<u8>,
    last_render: Option<TailRender>,
}

impl LogTailer {
    pub fn new(config: LogStreamConfig) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.tail_lines.max(1)),
            config,
            active_file: None,
            offset: 0,
            remainder: Vec::new(),
            last_render: None,
        }
    }

    pub fn config(&self) -> &LogStreamConfig {
        &self.config
    }

    pub fn active_file(&self) -> Option<&Path> {
        self.active_file.as_deref()
    }

    pub fn tick(&mut self) -> Option<TailRender> {
        let (content, header) = match self.step() {
            Ok(result) => result,
            Err(err) => (format!("(log worker error) {err}"), None),
        };
        let header = header
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| self.config.glob.clone());
        let render = TailRender::new(&self.config.stream, &header, &content);
        if self.last_render.as_ref() == Some(&render) {
            return None;
        }
        self.last_render = Some(render.clone());
        Some(render)
    }

    fn step(&mut self) -> io::Result<(String, Option<PathBuf>)> {
        let Some(latest) = resolve_latest_file(&self.config.glob) else {
            if self.active_file.take().is_some() {
                self.buffer.clear();
            }
            self.offset = 0;
            self.remainder.clear();
            let content = if self.config.allow_missing {
                String::new()
            } else {
                format!("(missing) {}", self.config.glob)
            };
            return Ok((content, None));
        };

        if self.active_file.as_deref() != Some(latest.as_path()) {
            self.active_file = Some(latest.clone());
            self.offset = 0;
            self.remainder.clear();
            self.buffer.clear();
            for line in tail_lines(&latest, self.config.tail_lines, self.config.encoding)? {
                self.push_line(line);
            }
            self.offset = fs::metadata(&latest).map(|meta| meta.len()).unwrap_or(0);
            return Ok((self.joined(), Some(latest)));
        }

        let size = match fs::metadata(&latest) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok((self.joined(), Some(latest))),
        };
        if size < self.offset {
            self.offset = 0;
            self.remainder.clear();
        }
        if size > self.offset {
            let mut file = File::open(&latest)?;
            file.seek(SeekFrom::Start(self.offset))?;
            let mut chunk = Vec::with_capacity((size - self.offset) as usize);
            file.take(size - self.offset).read_to_end(&mut chunk)?;
            self.offset += chunk.len() as u64;

            let mut pending = std::mem::take(&mut self.remainder);
            pending.extend_from_slice(&chunk);
            let mut pieces: Vec<&[u8]> = pending.split(|byte| *byte == b'\n').collect();
            let tail = pieces.pop().unwrap_or_default().to_vec();
            for piece in pieces {
                let piece = piece.strip_suffix(b"\r").unwrap_or(piece);
                let line = self.config.encoding.decode(piece);
                self.push_line(line);
            }
            self.remainder = tail;
        }
        Ok((self.joined(), Some(latest)))
    }

    fn push_line(&mut self, line: String) {
        let line = clip_line(line, self.config.max_line_bytes);
        if self.buffer.len() >= self.config.tail_lines.max(1) {
            self.buffer.pop_front();
        }
        self.buffer.push_back(line);
    }

    fn joined(&self) -> String {
        self.buffer
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn clip_line(line: String, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line;
    }
    let mut cut = max_bytes;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATED_MARKER}", &line[..cut])
}

/// Polls `tailer` every `poll` interval on the blocking pool and publishes changed
/// renders until shutdown.
pub fn spawn_tail_task(
    target_id: String,
    tailer: LogTailer,
    publisher: watch::Sender<TailRender>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = tailer.config().stream.clone();
        let poll = tailer.config().poll.max(Duration::from_millis(1));
        let mut tailer = Some(tailer);
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(event = "log_tail_start", target = %target_id, stream = %stream);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(mut current) = tailer.take() else {
                        break;
                    };
                    let joined = tokio::task::spawn_blocking(move || {
                        let render = current.tick();
                        (current, render)
                    })
                    .await;
                    match joined {
                        Ok((current, render)) => {
                            tailer = Some(current);
                            if let Some(render) = render {
                                debug!(event = "log_tail_render", target = %target_id, stream = %stream, file = %render.path);
                                publisher.send_replace(render);
                            }
                        }
                        Err(err) => {
                            warn!(event = "log_tail_task_failed", target = %target_id, stream = %stream, error = %err);
                            break;
                        }
                    }
                }
            }
        }
        info!(event = "log_tail_stop", target = %target_id, stream = %stream);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn stream_config(glob: &str) -> LogStreamConfig {
        LogStreamConfig {
            stream: "app".into(),
            title: "App".into(),
            glob: glob.into(),
            tail_lines: 3,
            max_line_bytes: 64,
            poll: Duration::from_millis(100),
            encoding: TextEncoding::Utf8,
            allow_missing: true,
        }
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        file.write_all(text.as_bytes()).expect("write");
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .expect("open")
            .set_modified(when)
            .expect("set mtime");
    }

    #[test]
    fn newest_match_wins_and_ties_break_on_path() {
        let dir = TempDir::new().expect("tempdir");
        let older = dir.path().join("app-1.log");
        let newer = dir.path().join("app-2.log");
        let other = dir.path().join("app-3.txt");
        for path in [&older, &newer, &other] {
            append(path, "x\n");
        }
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&older, base);
        set_mtime(&newer, base + Duration::from_secs(10));
        set_mtime(&other, base + Duration::from_secs(20));

        let glob = format!("{}/app-*.log", dir.path().display());
        assert_eq!(resolve_latest_file(&glob), Some(newer.clone()));

        set_mtime(&older, base + Duration::from_secs(10));
        assert_eq!(resolve_latest_file(&glob), Some(newer));
    }

    #[test]
    fn recursive_glob_descends_into_subdirectories() {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).expect("mkdir");
        let target = nested.join("deep.log");
        append(&target, "x\n");
        let glob = format!("{}/**/*.log", dir.path().display());
        assert_eq!(resolve_latest_file(&glob), Some(target));
        let shallow = format!("{}/*.log", dir.path().display());
        assert_eq!(resolve_latest_file(&shallow), None);
    }

    #[test]
    fn seeds_from_the_last_lines() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("app.log");
        append(&path, "one\ntwo\nthree\nfour\nfive\n");
        let lines = tail_lines(&path, 2, TextEncoding::Utf8).expect("tail");
        assert_eq!(lines, vec!["four", "five"]);
    }

    #[test]
    fn follows_growth_with_partial_lines() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("app.log");
        append(&path, "boot\n");
        let mut tailer = LogTailer::new(stream_config(&path.display().to_string()));

        let first = tailer.tick().expect("first render");
        assert_eq!(first.text, format!("(stream=app file={})\nboot", path.display()));
        assert!(tailer.tick().is_none(), "unchanged render is not republished");

        append(&path, "half");
        assert!(tailer.tick().is_none(), "partial line stays buffered");
        append(&path, " done\r\nnext\n");
        let render = tailer.tick().expect("growth");
        assert!(render.text.ends_with("boot\nhalf done\nnext"), "{}", render.text);
    }

    #[test]
    fn buffer_keeps_only_tail_lines() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("app.log");
        append(&path, "");
        let mut tailer = LogTailer::new(stream_config(&path.display().to_string()));
        tailer.tick();
        append(&path, "1\n2\n3\n4\n5\n");
        let render = tailer.tick().expect("render");
        assert!(render.text.ends_with(")\n3\n4\n5"), "{}", render.text);
    }

    #[test]
    fn truncation_resets_offset() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("app.log");
        append(&path, "aaaa\nbbbb\n");
        let mut tailer = LogTailer::new(stream_config(&path.display().to_string()));
        tailer.tick();

        fs::write(&path, "c\n").expect("truncate");
        let render = tailer.tick().expect("after truncate");
        assert!(render.text.ends_with("aaaa\nbbbb\nc"), "{}", render.text);
    }

    #[test]
    fn long_lines_are_clipped_on_char_boundary() {
        let clipped = clip_line("é".repeat(40), 64);
        assert!(clipped.ends_with(TRUNCATED_MARKER));
        assert_eq!(clipped.len(), 64 + TRUNCATED_MARKER.len());
        let odd = clip_line(format!("a{}", "é".repeat(40)), 64);
        assert_eq!(odd.len(), 63 + TRUNCATED_MARKER.len());
    }

    #[test]
    fn missing_file_renders_marker_unless_allowed() {
        let dir = TempDir::new().expect("tempdir");
        let glob = format!("{}/none-*.log", dir.path().display());
        let mut config = stream_config(&glob);
        config.allow_missing = false;
        let mut strict = LogTailer::new(config);
        let render = strict.tick().expect("render");
        assert_eq!(render.text, format!("(stream=app file={glob})\n(missing) {glob}"));

        let mut lenient = LogTailer::new(stream_config(&glob));
        assert_eq!(
            lenient.tick().expect("render").text,
            format!("(stream=app file={glob})")
        );
    }

    #[test]
    fn rotation_to_a_newer_file_reseeds() {
        let dir = TempDir::new().expect("tempdir");
        let first = dir.path().join("app-1.log");
        append(&first, "old\n");
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&first, base);
        let glob = format!("{}/app-*.log", dir.path().display());
        let mut tailer = LogTailer::new(stream_config(&glob));
        tailer.tick();
        assert_eq!(tailer.active_file(), Some(first.as_path()));

        let second = dir.path().join("app-2.log");
        append(&second, "new\n");
        set_mtime(&second, base + Duration::from_secs(5));
        let render = tailer.tick().expect("rotated");
        assert_eq!(render.path, second.display().to_string());
        assert!(render.text.ends_with(")\nnew"), "{}", render.text);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn task_publishes_and_stops_on_shutdown() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("app.log");
        append(&path, "hello\n");
        let config = stream_config(&path.display().to_string());
        let (publisher, mut renders) = watch::channel(TailRender::pending(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_tail_task("t".into(), LogTailer::new(config), publisher, shutdown_rx);

        tokio::time::timeout(Duration::from_secs(3), renders.changed())
            .await
            .expect("render timeout")
            .expect("publisher alive");
        assert!(renders.borrow().text.ends_with("hello"));

        shutdown_tx.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("stop timeout")
            .expect("join");
    }
}
