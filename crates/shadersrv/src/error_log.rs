//! Compile-error reporting.
//!
//! Failed compiles produce a [`CompileError`] report. Reports land in a
//! bounded queue; the tick worker batches them up once errors stop arriving
//! for the configured interval and hands the batch to a [`ReportSink`]. The
//! production sink is the external mail reporter; the default here renders
//! the reports through `tracing`.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::hash::Fingerprint;

const QUEUE_CAP: usize = 150;
const FORCE_FLUSH_LEN: usize = 100;

/// Everything known about one failed compile, ready for rendering.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub entry: String,
    pub error_text: String,
    pub ccs: Vec<String>,
    pub peer_ip: String,
    pub requests: Vec<String>,
    pub program: String,
    pub project: String,
    pub platform: String,
    pub compiler: String,
    pub language: String,
    pub tags: String,
    pub profile: String,

    shader: String,
    hash_errors: String,
    errors: Vec<(i64, String)>,
    duplicates: u32,
}

#[allow(clippy::too_many_arguments)]
impl CompileError {
    pub fn new(
        entry: &str,
        error_text: &str,
        ccs: &str,
        peer_ip: &str,
        request_line: &str,
        program: &str,
        project: &str,
        platform: &str,
        compiler: &str,
        language: &str,
        tags: &str,
        profile: &str,
    ) -> Self {
        let error_text = error_text.trim_end_matches(['\r', '\n']).to_string();
        let mut report = CompileError {
            entry: entry.to_string(),
            shader: derive_shader_name(request_line, entry),
            hash_errors: String::new(),
            errors: Vec::new(),
            duplicates: 0,
            error_text,
            ccs: ccs
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            peer_ip: peer_ip.to_string(),
            requests: vec![request_line.to_string()],
            program: program.to_string(),
            project: project.to_string(),
            platform: platform.to_string(),
            compiler: compiler.to_string(),
            language: language.to_string(),
            tags: tags.to_string(),
            profile: profile.to_string(),
        };
        report.extract_error_lines();
        report
    }

    /// Pulls the `error` lines out of the compiler output. Recognized
    /// shapes: a line starting with `error`, and
    /// `%filename%(<line>[,col]): error ...`.
    fn extract_error_lines(&mut self) {
        for line in self.error_text.split('\n').map(str::to_string).collect::<Vec<_>>() {
            if line.starts_with("error") {
                self.hash_errors.push_str(&line);
                self.errors.push((-1, line));
                continue;
            }
            if !line.contains(": error") || !line.starts_with("%filename%(") {
                continue;
            }

            let bytes = line.as_bytes();
            let mut i = "%filename%(".len();
            let mut line_number: i64 = 0;
            let mut in_line_part = true;
            while i < bytes.len()
                && (bytes[i].is_ascii_digit() || bytes[i] == b',' || bytes[i] == b'-')
            {
                if bytes[i] == b',' {
                    in_line_part = false;
                } else if in_line_part && bytes[i].is_ascii_digit() {
                    line_number = line_number * 10 + i64::from(bytes[i] - b'0');
                }
                i += 1;
            }
            if i >= bytes.len() || bytes[i] != b')' {
                continue;
            }
            i += 1;
            while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b':') {
                i += 1;
            }
            if !line[i..].starts_with("error") {
                continue;
            }

            self.hash_errors.push_str(&line[i..]);
            self.errors.push((line_number, line));
        }
        self.errors.sort_by_key(|(number, _)| *number);
    }

    pub fn name(&self) -> String {
        format!(
            "[{}] Shader Compile Errors in {} on {} for {} {}",
            self.tags, self.shader, self.language, self.platform, self.compiler
        )
    }

    pub fn filename(&self) -> String {
        format!("{}.txt", self.entry)
    }

    /// Stable identity used for deduplication across clients.
    pub fn fingerprint(&self) -> Fingerprint {
        let identity = format!(
            "{}{}{}{}{}{}{}{}{}{}",
            self.name(),
            self.filename(),
            self.peer_ip,
            self.platform,
            self.compiler,
            self.language,
            self.project,
            self.entry,
            self.profile,
            self.hash_errors
        );
        Fingerprint::of(identity.as_bytes())
    }

    pub fn can_merge(&self, other: &CompileError) -> bool {
        self.platform == other.platform
            && self.compiler == other.compiler
            && self.language == other.language
            && self.shader == other.shader
            && self.ccs == other.ccs
    }

    pub fn absorb_duplicate(&mut self, other: CompileError) {
        self.duplicates += 1;
        self.requests.extend(other.requests);
    }

    pub fn duplicates(&self) -> u32 {
        self.duplicates
    }

    /// Console rendering: the extracted errors with a little source context,
    /// then the full compiler output.
    pub fn tty_details(&self) -> String {
        let mut out = format!(
            "===  Shader compile error in {} {{ {} }}\n* Reported error(s):\n\n",
            self.entry, self.requests[0]
        );
        out.push_str(&self.error_lines().replace("%filename%", &self.filename()));
        out.push_str(&self.error_text);
        out
    }

    fn error_lines(&self) -> String {
        let mut out = String::new();
        for (i, (line_number, text)) in self.errors.iter().enumerate() {
            if *line_number < 0 {
                out.push_str(text);
                out.push('\n');
            } else if i > 0 && self.errors[i - 1].0 == *line_number {
                // Consecutive errors on one line share their context block.
                out.pop();
                out.push_str(text);
                out.push_str("\n\n");
            } else {
                out.push_str(&self.context(*line_number, 2));
                out.push('\n');
                out.push_str(text);
                out.push_str("\n\n");
            }
        }
        out
    }

    /// A window of the submitted program around `line_number`, the failing
    /// line marked with `*`.
    fn context(&self, line_number: i64, radius: i64) -> String {
        let lines: Vec<&str> = self.program.split('\n').collect();
        let target = line_number - 1; // error lines are 1-based
        let from = (target - radius).max(0);
        let to = (target + radius).min(lines.len() as i64 - 1);

        let mut out = String::new();
        for i in from..=to {
            let marker = if i == target { '*' } else { ' ' };
            out.push_str(&format!("{:3} {}> {}\n", i + 1, marker, lines[i as usize]));
        }
        out
    }
}

fn derive_shader_name(request_line: &str, entry: &str) -> String {
    if !request_line.is_empty() {
        let mut shader = request_line.to_string();
        if let Some(offset) = shader.find('>') {
            shader.drain(..=offset);
        }
        if let Some(offset) = shader.find('@') {
            shader.truncate(offset);
        }
        if let Some(offset) = shader.find('/') {
            shader.truncate(offset);
        }
        return shader;
    }

    // No request line: fall back to the entry function, trimming a
    // `..VS`/`..PS` style suffix.
    let mut shader = entry.to_string();
    if shader.ends_with('S') && shader.len() >= 2 {
        shader.truncate(shader.len() - 2);
    }
    shader
}

/// Receives finished report batches. The mail reporter implements this
/// outside the core.
pub trait ReportSink: Send + Sync {
    fn deliver(&self, reports: Vec<CompileError>);
}

/// Default sink: renders every report through `tracing`.
pub struct LogSink;

impl ReportSink for LogSink {
    fn deliver(&self, reports: Vec<CompileError>) {
        for report in reports {
            info!(
                duplicates = report.duplicates(),
                "{}\n{}",
                report.name(),
                report.tty_details()
            );
        }
    }
}

pub struct ErrorLog {
    queue: Mutex<Vec<CompileError>>,
    last_error: Mutex<Option<Instant>>,
    interval: Duration,
    dedupe: bool,
    sink: Box<dyn ReportSink>,
}

impl ErrorLog {
    pub fn new(interval_secs: u64, dedupe: bool, sink: Box<dyn ReportSink>) -> Self {
        ErrorLog {
            queue: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            interval: Duration::from_secs(interval_secs),
            dedupe,
            sink,
        }
    }

    /// Queues a report. When the queue is saturated the report is dropped;
    /// losing a report is better than unbounded growth during an error
    /// storm.
    pub fn add(&self, report: CompileError) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() > QUEUE_CAP {
                warn!("error report queue is full; dropping a report");
                return;
            }
            queue.push(report);
        }
        *self.last_error.lock().unwrap() = Some(Instant::now());
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the queue to the sink once errors have stopped arriving for
    /// the configured interval, or immediately when the queue has grown
    /// large. A zero interval disables reporting entirely.
    pub fn tick(&self) {
        if self.interval.is_zero() {
            return;
        }

        let (size, last) = {
            let queue = self.queue.lock().unwrap();
            (queue.len(), *self.last_error.lock().unwrap())
        };
        if size == 0 {
            return;
        }
        let quiet_long_enough = last
            .map(|at| at.elapsed() > self.interval)
            .unwrap_or(true);
        if size <= FORCE_FLUSH_LEN && !quiet_long_enough {
            return;
        }

        let drained: Vec<CompileError> = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        let batch = if self.dedupe {
            merge_reports(drained)
        } else {
            drained
        };
        info!(reports = batch.len(), "delivering compile-error reports");
        self.sink.deliver(batch);
    }
}

fn merge_reports(reports: Vec<CompileError>) -> Vec<CompileError> {
    let mut merged: Vec<CompileError> = Vec::with_capacity(reports.len());
    for report in reports {
        match merged.iter_mut().find(|existing| {
            existing.can_merge(&report) && existing.fingerprint() == report.fingerprint()
        }) {
            Some(existing) => existing.absorb_duplicate(report),
            None => merged.push(report),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn report(entry: &str, errors: &str) -> CompileError {
        CompileError::new(
            entry,
            errors,
            "",
            "10.0.0.1",
            "<1>Foo@FooPS()()(0)(0)(0)(ps_5_0)",
            "float4 main() : SV_TARGET\n{\n    return bad;\n}\n",
            "Game/",
            "PC",
            "D3D11_FXC",
            "D3D11",
            "nightly",
            "ps_5_0",
        )
    }

    #[test]
    fn shader_name_comes_from_the_request_line() {
        let r = report("FooPS", "error X1000: failure");
        assert_eq!(r.name(), "[nightly] Shader Compile Errors in Foo on D3D11 for PC D3D11_FXC");
    }

    #[test]
    fn shader_name_falls_back_to_trimmed_entry() {
        let r = CompileError::new(
            "FooPS", "error", "", "1.2.3.4", "", "", "P/", "PC", "D3D11_FXC", "D3D11", "", "ps_5_0",
        );
        assert!(r.name().contains("in Foo on"));
    }

    #[test]
    fn extracts_line_numbers_from_filename_errors() {
        let r = report(
            "FooPS",
            "%filename%(3,12): error X3004: undeclared identifier 'bad'\nerror X1000: compile failed",
        );
        let details = r.tty_details();
        assert!(details.contains("FooPS.txt"));
        assert!(details.contains("error X3004"));
        assert!(details.contains("return bad;"));
        // Context marks the failing line.
        assert!(details.contains("  3 *> "));
    }

    #[test]
    fn merging_needs_matching_target_and_shader() {
        let a = report("FooPS", "error X1000: one");
        let b = report("FooPS", "error X1000: one");
        let mut c = report("FooPS", "error X2000: different");
        assert!(a.can_merge(&b));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.can_merge(&c));
        assert_ne!(a.fingerprint(), c.fingerprint());

        c = CompileError::new(
            "BarPS",
            "error X1000: one",
            "",
            "10.0.0.1",
            "<1>Bar@BarPS()()(0)(0)(0)(ps_5_0)",
            "",
            "Game/",
            "PC",
            "D3D11_FXC",
            "D3D11",
            "nightly",
            "ps_5_0",
        );
        assert!(!a.can_merge(&c));
    }

    struct CaptureSink(Arc<StdMutex<Vec<Vec<CompileError>>>>);
    impl ReportSink for CaptureSink {
        fn deliver(&self, reports: Vec<CompileError>) {
            self.0.lock().unwrap().push(reports);
        }
    }

    #[test]
    fn tick_dedupes_identical_reports() {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let log = ErrorLog::new(1, true, Box::new(CaptureSink(captured.clone())));

        for _ in 0..3 {
            log.add(report("FooPS", "error X1000: failure"));
        }
        // Not yet quiet for a full interval; force the flush via size is not
        // reachable here, so simulate the quiet period.
        *log.last_error.lock().unwrap() =
            Some(Instant::now() - Duration::from_secs(5));
        log.tick();

        let batches = captured.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].duplicates(), 2);
        assert_eq!(batches[0][0].requests.len(), 3);
    }

    #[test]
    fn zero_interval_disables_delivery() {
        let captured = Arc::new(StdMutex::new(Vec::new()));
        let log = ErrorLog::new(0, true, Box::new(CaptureSink(captured.clone())));
        log.add(report("FooPS", "error X1000: failure"));
        log.tick();
        assert!(captured.lock().unwrap().is_empty());
        assert_eq!(log.len(), 1);
    }
}
