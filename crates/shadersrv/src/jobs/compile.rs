//! The compile job: cache lookup, fallback forwarding, local compilation.

use std::{
    net::Ipv4Addr,
    path::{Component, Path, PathBuf},
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use tracing::{debug, info, warn};

use crate::{
    codec::FramedStream,
    compress,
    config::{compiler_id, Config},
    error_log::CompileError,
    hash::Fingerprint,
    process::{run_compiler, CommandOutcome, TempFileGuard},
    protocol::{JobState, ProtocolVersion},
    server::Server,
};

use super::{attr, required_attr, Attributes, JobError};

/// Executables older clients may name inside their compile flags.
const LEGACY_EXECUTABLES: [&str; 7] = [
    "fxc.exe",
    "FXC.exe",
    "HLSLcc.exe",
    "HLSLcc_dedicated.exe",
    "DXProvoShaderCompiler.exe",
    "dxcGL",
    "dxcMetal",
];

/// Filename scrub table for shader dumps, applied character for character.
const FILENAME_SCRUB: [(char, char); 8] = [
    ('<', '('),
    ('>', ')'),
    ('/', '_'),
    ('|', '+'),
    ('*', '^'),
    (':', ';'),
    ('?', '!'),
    ('%', '$'),
];

/// Byte count of the payload that participates in the request fingerprint.
/// V1 hashes everything; V2+ stops at the `HashStop` sentinel so clients can
/// append metadata that must not affect caching.
pub fn fingerprint_scope(payload: &[u8], version: ProtocolVersion) -> usize {
    if version >= ProtocolVersion::V2 {
        find_subslice(payload, b"HashStop").unwrap_or(payload.len())
    } else {
        payload.len()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Tracks one in-flight compile against the process-wide counters.
struct CompileTicket<'a> {
    server: &'a Server,
}

impl<'a> CompileTicket<'a> {
    fn new(server: &'a Server) -> Self {
        let active = server.active_compiles.fetch_add(1, Ordering::SeqCst) + 1;
        server.max_active_compiles.fetch_max(active, Ordering::SeqCst);
        CompileTicket { server }
    }
}

impl Drop for CompileTicket<'_> {
    fn drop(&mut self) {
        self.server.active_compiles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Produces the compressed compiled-shader blob for a request. The returned
/// bytes are ready to frame; the caller reports `Done`.
pub async fn run(
    server: &Arc<Server>,
    attrs: &Attributes,
    version: ProtocolVersion,
    payload: &[u8],
    peer: Ipv4Addr,
) -> Result<Vec<u8>, JobError> {
    let _ticket = CompileTicket::new(server);

    let scope = fingerprint_scope(payload, version);
    let fingerprint = Fingerprint::of(&payload[..scope]);

    if let Some(cached) = server.cache.find(&fingerprint) {
        debug!(%fingerprint, "cache hit");
        return Ok(cached);
    }

    if !server.config.fallback_servers.is_empty()
        && server.active_compiles.load(Ordering::SeqCst) > server.config.fallback_threshold
    {
        if let Some(forwarded) = forward_to_peer(server, payload, version).await {
            return Ok(forwarded);
        }
    }

    let raw = compile_locally(server, attrs, version, peer).await?;
    if raw.is_empty() {
        return Err(JobError::with_message(
            JobState::ErrorCompile,
            "failed to compile request",
        ));
    }

    let body = compress::deflate(&raw)
        .map_err(|_| JobError::with_message(JobState::ErrorCompress, "failed to compress request"))?;

    if attr(attrs, "Caching").unwrap_or("1") == "1" {
        server.cache.add(fingerprint, &body);
    }

    Ok(body)
}

/// Relays the request to the next fallback peer. Any failure (connect,
/// short response, remote error state) logs and returns `None` so the
/// caller compiles locally.
async fn forward_to_peer(
    server: &Server,
    payload: &[u8],
    version: ProtocolVersion,
) -> Option<Vec<u8>> {
    let peers = &server.config.fallback_servers;
    let index = server.fallback_cursor.fetch_add(1, Ordering::SeqCst) as usize % peers.len();
    let peer = &peers[index];
    info!(peer = %peer, "load above threshold; forwarding compile to fallback peer");

    let mut sock = match FramedStream::connect(peer, server.config.tcp_port).await {
        Ok(sock) => sock,
        Err(error) => {
            warn!(peer = %peer, %error, "fallback peer unreachable; compiling locally");
            return None;
        }
    };
    if let Err(error) = sock.forward(payload).await {
        warn!(peer = %peer, %error, "forward failed; compiling locally");
        return None;
    }
    match sock.backward().await {
        Ok(reply) => {
            let remote_failed = reply.len() <= 4
                || (version == ProtocolVersion::V2 && reply[4] != JobState::Done.code());
            if remote_failed {
                warn!(peer = %peer, bytes = reply.len(), "fallback peer returned an error; compiling locally");
                None
            } else {
                Some(reply)
            }
        }
        Err(error) => {
            warn!(peer = %peer, %error, "no reply from fallback peer; compiling locally");
            None
        }
    }
}

async fn compile_locally(
    server: &Arc<Server>,
    attrs: &Attributes,
    version: ProtocolVersion,
    peer: Ipv4Addr,
) -> Result<Vec<u8>, JobError> {
    let config = &server.config;
    let target = resolve_target(config, attrs, version)?;

    let shader_path = lexical_normalize(&target.shader_path);
    if !shader_path.starts_with(lexical_normalize(&config.root)) {
        return Err(JobError::with_message(
            JobState::Error,
            "shaders output path is invalid",
        ));
    }
    let _ = std::fs::create_dir_all(&shader_path);

    let profile = required_attr(attrs, "Profile", JobState::ErrorInvalidProfile)?;
    let program = required_attr(attrs, "Program", JobState::ErrorInvalidProgram)?;
    let entry = required_attr(attrs, "Entry", JobState::ErrorInvalidEntry)?;
    let request_line =
        required_attr(attrs, "ShaderRequest", JobState::ErrorInvalidShaderRequestLine)?;
    let flags = required_attr(attrs, "CompileFlags", JobState::ErrorInvalidCompileFlags)?;

    // The permutation split below indexes on the first paren pair; reject
    // request lines that do not carry one.
    match (request_line.find('('), request_line.find(')')) {
        (Some(open), Some(close)) if open < close => {}
        _ => {
            return Err(JobError::with_message(
                JobState::ErrorInvalidShaderRequestLine,
                "invalid ShaderRequest attribute",
            ))
        }
    }

    let index = server.next_temp_index();
    let tmp_in = config.temp_dir.join(format!("{index}.In"));
    let tmp_out = config.temp_dir.join(format!("{index}.Out"));
    let _in_guard = TempFileGuard::new(&tmp_in);
    let _out_guard = TempFileGuard::new(&tmp_out);
    let _ = std::fs::create_dir_all(&config.temp_dir);
    std::fs::write(&tmp_in, program.as_bytes()).map_err(|_| {
        JobError::with_message(
            JobState::ErrorFileIo,
            format!("could not write {}", tmp_in.display()),
        )
    })?;

    let command = if version >= ProtocolVersion::V2_2 {
        assemble_command(config, &target.compiler, flags, entry, profile, &tmp_out, &tmp_in)?
    } else {
        assemble_legacy_command(config, flags, entry, profile, &tmp_out, &tmp_in)?
    };

    let dump = config
        .dump_shaders
        .then(|| DumpTarget::new(&shader_path, request_line));
    if let Some(dump) = &dump {
        dump.write_source(program);
    }

    if config.print_commands {
        info!(command = %command, "compiler command");
    }

    let started = Instant::now();
    let outcome = match run_compiler(&command, false).await {
        Ok(outcome) => outcome,
        Err(error) => CommandOutcome {
            success: false,
            stderr: format!("could not launch compiler: {error}"),
        },
    };

    if !outcome.success {
        let filtered = filter_compiler_output(&outcome.stderr, index, &tmp_in);
        let report = CompileError::new(
            entry,
            &filtered,
            attr(attrs, "EmailCCs").unwrap_or_default(),
            &peer.to_string(),
            request_line,
            program,
            attr(attrs, "Project").unwrap_or("Unk/"),
            &target.platform,
            &target.compiler,
            &target.language,
            attr(attrs, "Tags").unwrap_or_default(),
            profile,
        );
        let details = report.tty_details();
        if config.print_errors {
            tracing::error!("{}\n{}", report.name(), details);
        }
        server.error_log.add(report);
        return Err(JobError::with_message(JobState::ErrorCompile, details));
    }

    if config.print_warnings && !outcome.stderr.is_empty() {
        warn!("{}", outcome.stderr);
    }

    let raw = std::fs::read(&tmp_out).map_err(|_| {
        JobError::with_message(
            JobState::ErrorFileIo,
            format!("Could not read: {}", tmp_out.display()),
        )
    })?;

    if let Some(dump) = &dump {
        dump.write_output(&raw, &target.language);
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let total_s = server
        .total_compile_ms
        .fetch_add(elapsed_ms, Ordering::Relaxed)
        / 1000;
    info!(
        ms = elapsed_ms,
        total_s,
        platform = %target.platform,
        compiler = %target.compiler,
        language = %target.language,
        profile,
        entry,
        "compiled"
    );

    Ok(raw)
}

struct CompileTarget {
    platform: String,
    compiler: String,
    language: String,
    shader_path: PathBuf,
}

fn resolve_target(
    config: &Config,
    attrs: &Attributes,
    version: ProtocolVersion,
) -> Result<CompileTarget, JobError> {
    if version >= ProtocolVersion::V2_3 {
        // Already validated by the dispatcher.
        let platform = attr(attrs, "Platform").unwrap_or_default().to_string();
        let compiler = attr(attrs, "Compiler").unwrap_or_default().to_string();
        let language = attr(attrs, "Language").unwrap_or_default().to_string();
        let shader_path = config
            .shader_dir
            .join(format!("{platform}-{compiler}-{language}"));
        return Ok(CompileTarget {
            platform,
            compiler,
            language,
            shader_path,
        });
    }

    // Before V2_3 the Platform attribute names the shader language.
    let language = required_attr(attrs, "Platform", JobState::ErrorInvalidPlatform)?.to_string();
    let mapped = match language.as_str() {
        "GL4" | "GLES3_0" | "GLES3_1" => compiler_id::GLSL_HLSLCC,
        "DX11" => compiler_id::D3D11_FXC,
        "METAL" => compiler_id::METAL_HLSLCC,
        _ => {
            return Err(JobError::with_message(
                JobState::ErrorInvalidLanguage,
                "trying to compile with invalid shader language",
            ))
        }
    };
    let compiler = if version < ProtocolVersion::V2_2 {
        // The executable arrives inside the compile flags instead.
        "N/A".to_string()
    } else {
        if !config.compiler_is_valid(mapped) {
            return Err(JobError::with_message(
                JobState::ErrorInvalidCompiler,
                "trying to compile with invalid shader compiler",
            ));
        }
        mapped.to_string()
    };

    let shader_path = config.shader_dir.join(&language);
    Ok(CompileTarget {
        platform: "N/A".to_string(),
        compiler,
        language,
        shader_path,
    })
}

/// Resolves `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// V2_2+ command assembly: trusted executable from the compiler table, the
/// client's `CompileFlags` as a positional `%s` format string.
fn assemble_command(
    config: &Config,
    compiler: &str,
    flags: &str,
    entry: &str,
    profile: &str,
    tmp_out: &Path,
    tmp_in: &Path,
) -> Result<String, JobError> {
    let Some(executable) = config.compiler_executable(compiler) else {
        return Err(JobError::with_message(
            JobState::ErrorInvalidCompiler,
            "trying to compile with unknown compiler",
        ));
    };

    // Quote path + executable to survive spaces; the table value keeps a
    // trailing space that must stay outside the quotes.
    let joined = config.compiler_dir.join(executable).display().to_string();
    let mut format = String::with_capacity(joined.len() + flags.len() + 2);
    format.push('"');
    match joined.strip_suffix(' ') {
        Some(head) => {
            format.push_str(head);
            format.push_str("\" ");
        }
        None => {
            format.push_str(&joined);
            format.push('"');
        }
    }
    format.push_str(flags);

    let out = tmp_out.display().to_string();
    let input = tmp_in.display().to_string();
    if flags.contains("-fxc") {
        let Some(fxc) = config.compiler_executable(compiler_id::D3D11_FXC) else {
            return Err(JobError::with_message(
                JobState::ErrorInvalidCompiler,
                "FXC compiler executable cannot be found",
            ));
        };
        let fxc_path = config
            .compiler_dir
            .join(fxc.trim_end())
            .display()
            .to_string();
        substitute_placeholders(&format, &[&fxc_path, entry, profile, &out, &input])
    } else {
        substitute_placeholders(&format, &[entry, profile, &out, &input])
    }
}

/// Pre-V2_2 command assembly: the flags name the executable themselves and
/// must pass the strict legacy validator before anything is spawned.
fn assemble_legacy_command(
    config: &Config,
    flags: &str,
    entry: &str,
    profile: &str,
    tmp_out: &Path,
    tmp_in: &Path,
) -> Result<String, JobError> {
    if !legacy_flags_valid(flags) {
        return Err(JobError::with_message(
            JobState::ErrorInvalidCompileFlags,
            "CompileFlags failed validation",
        ));
    }

    let compiler_dir = config.compiler_dir.display().to_string();
    let out = tmp_out.display().to_string();
    let input = tmp_in.display().to_string();

    let command = if flags.contains("-fxc=\"%s") {
        // The tail after the placeholder names a second executable; it gets
        // the same validation as the primary one.
        let tail_at = flags.find("%s").map(|at| at + 2).unwrap_or(0);
        if !legacy_flags_valid(&flags[tail_at..]) {
            return Err(JobError::with_message(
                JobState::ErrorInvalidCompileFlags,
                "CompileFlags failed validation",
            ));
        }
        substitute_placeholders(flags, &[&compiler_dir, entry, profile, &out, &input])?
    } else {
        substitute_placeholders(flags, &[entry, profile, &out, &input])?
    };

    Ok(format!("{compiler_dir}/{command}"))
}

fn legacy_flags_valid(flags: &str) -> bool {
    // The engine always sends options after the executable; a command with
    // no space is not something it would produce.
    let Some(space) = flags.find(' ') else {
        return false;
    };
    let command = &flags[..space];
    if command.contains("..") {
        return false;
    }
    if command.contains("\\\\") || command.contains(':') {
        return false;
    }
    LEGACY_EXECUTABLES.iter().any(|name| command.contains(name))
}

/// Positional `%s` substitution. The placeholder count must match exactly:
/// a mismatched format string is a malformed (or malicious) request, not a
/// formatting problem to paper over.
fn substitute_placeholders(format: &str, args: &[&str]) -> Result<String, JobError> {
    let parts: Vec<&str> = format.split("%s").collect();
    if parts.len() - 1 != args.len() {
        return Err(JobError::with_message(
            JobState::ErrorInvalidCompileFlags,
            format!(
                "CompileFlags has {} placeholders, expected {}",
                parts.len() - 1,
                args.len()
            ),
        ));
    }
    let mut out = String::with_capacity(format.len() + args.iter().map(|a| a.len()).sum::<usize>());
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if i < args.len() {
            out.push_str(args[i]);
        }
    }
    Ok(out)
}

/// Replaces temp-file paths in compiler output with `%filename%` so error
/// reports are stable across requests, and normalizes line endings.
fn filter_compiler_output(stderr: &str, index: u64, tmp_in: &Path) -> String {
    let full = tmp_in.display().to_string();
    stderr
        .replace(&format!("{full}.patched"), "%filename%")
        .replace(&full, "%filename%")
        .replace(&format!("{index}.In.patched"), "%filename%")
        .replace(&format!("{index}.In"), "%filename%")
        .replace("\r\n", "\n")
}

/// Where shader dumps land when `DumpShaders` is on: the source next to its
/// permutation, keyed by shader name and the CRC32 of the permutation.
struct DumpTarget {
    stem: PathBuf,
    permutation: String,
}

impl DumpTarget {
    fn new(shader_dir: &Path, request_line: &str) -> Self {
        let split = request_line.find('(').unwrap_or(request_line.len());
        let name = scrub_filename(&request_line[..split]);
        let permutation = request_line[split..].to_string();

        let mut crc = flate2::Crc::new();
        crc.update(permutation.as_bytes());
        DumpTarget {
            stem: shader_dir.join(format!("{name}_{}", crc.sum())),
            permutation,
        }
    }

    fn write_source(&self, program: &str) {
        if let Err(error) = std::fs::write(self.with_extension("hlsl"), program) {
            warn!(%error, "could not dump shader source");
        }
        if let Err(error) = std::fs::write(self.with_extension("txt"), &self.permutation) {
            warn!(%error, "could not dump shader permutation");
        }
    }

    fn write_output(&self, compiled: &[u8], language: &str) {
        let extension = language.to_lowercase();
        if let Err(error) = std::fs::write(self.with_extension(&extension), compiled) {
            warn!(%error, "could not dump compiled shader");
        }
    }

    fn with_extension(&self, extension: &str) -> PathBuf {
        PathBuf::from(format!("{}.{extension}", self.stem.display()))
    }
}

fn scrub_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            FILENAME_SCRUB
                .iter()
                .find(|(from, _)| *from == c)
                .map(|(_, to)| *to)
                .unwrap_or(c)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_scope_honors_hash_stop_for_v2() {
        let payload = b"<Compile Program=\"x\"/>HashStop<Meta/>";
        let stop = payload.windows(8).position(|w| w == b"HashStop").unwrap();
        assert_eq!(fingerprint_scope(payload, ProtocolVersion::V2_3), stop);
        assert_eq!(fingerprint_scope(payload, ProtocolVersion::V1), payload.len());

        let plain = b"<Compile/>";
        assert_eq!(fingerprint_scope(plain, ProtocolVersion::V2_3), plain.len());
    }

    #[test]
    fn placeholder_substitution_is_positional() {
        let out = substitute_placeholders("/E %s /T %s /Fo %s %s", &["main", "ps_5_0", "o", "i"])
            .unwrap();
        assert_eq!(out, "/E main /T ps_5_0 /Fo o i");
    }

    #[test]
    fn placeholder_count_mismatch_is_rejected() {
        let error = substitute_placeholders("%s %s", &["a", "b", "c"]).unwrap_err();
        assert_eq!(error.state, JobState::ErrorInvalidCompileFlags);
        let error = substitute_placeholders("%s %s %s %s %s", &["a", "b", "c", "d"]).unwrap_err();
        assert_eq!(error.state, JobState::ErrorInvalidCompileFlags);
    }

    #[test]
    fn legacy_validator_enforces_the_whitelist() {
        assert!(legacy_flags_valid("fxc.exe /nologo /E %s /T %s /Fo %s %s"));
        assert!(legacy_flags_valid("PCGL/V006/HLSLcc.exe -lang=440 %s %s %s %s"));

        // No options at all.
        assert!(!legacy_flags_valid("fxc.exe"));
        // Escaping the compiler directory.
        assert!(!legacy_flags_valid("../fxc.exe /E %s %s %s %s"));
        // Absolute and UNC paths.
        assert!(!legacy_flags_valid("C:/tools/fxc.exe /E %s %s %s %s"));
        assert!(!legacy_flags_valid("\\\\\\\\share/fxc.exe /E %s %s %s %s"));
        // Unknown executable.
        assert!(!legacy_flags_valid("rm -rf / %s %s %s %s"));
    }

    #[test]
    fn lexical_normalize_resolves_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/srv/root/Shaders/../Shaders/PC")),
            PathBuf::from("/srv/root/Shaders/PC")
        );
        assert_eq!(
            lexical_normalize(Path::new("/srv/root/./Shaders")),
            PathBuf::from("/srv/root/Shaders")
        );
        // Escapes are visible after normalization.
        assert!(!lexical_normalize(Path::new("/srv/root/Shaders/../../etc"))
            .starts_with("/srv/root"));
    }

    #[test]
    fn filename_scrub_table() {
        assert_eq!(scrub_filename("a<b>c/d|e*f:g?h%i"), "a(b)c_d+e^f;g!h$i");
        assert_eq!(scrub_filename("PlainName@Entry"), "PlainName@Entry");
    }

    #[test]
    fn compiler_output_filter_hides_temp_paths() {
        let tmp_in = Path::new("/srv/Temp/42.In");
        let raw = "/srv/Temp/42.In(3): error X1\r\n42.In.patched(4): error X2\r\n";
        let filtered = filter_compiler_output(raw, 42, tmp_in);
        assert_eq!(
            filtered,
            "%filename%(3): error X1\n%filename%(4): error X2\n"
        );
    }
}
