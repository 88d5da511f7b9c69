//! Server configuration.
//!
//! The core never parses configuration itself; it consumes a populated
//! [`Config`]. The binary fills one in from an optional `config.ini` next to
//! the executable: sectionless `key=value` lines, `#`/`;` comments, keys
//! matched case-insensitively.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
};

use tracing::warn;

pub const DEFAULT_TCP_PORT: u16 = 61453;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 255;
pub const DEFAULT_FALLBACK_THRESHOLD: i64 = 16;

/// Compiler-table keys. The engine sends these verbatim in the `Compiler`
/// attribute, so the spelling is part of the protocol.
pub mod compiler_id {
    pub const D3D11_FXC: &str = "D3D11_FXC";
    pub const GLSL_HLSLCC: &str = "GLSL_HLSLcc";
    pub const METAL_HLSLCC: &str = "METAL_HLSLcc";
    pub const GLSL_LLVM_DXC: &str = "GLSL_LLVM_DXC";
    pub const METAL_LLVM_DXC: &str = "METAL_LLVM_DXC";
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Trust anchor for every derived path; nothing may escape it.
    pub root: PathBuf,
    pub compiler_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub error_dir: PathBuf,
    pub shader_dir: PathBuf,

    pub tcp_port: u16,
    pub max_connections: u32,

    pub caching: bool,
    pub fallback_servers: Vec<String>,
    pub fallback_threshold: i64,

    pub allow_list: Vec<String>,

    /// Compiler id -> executable sub-path below `compiler_dir`. Each value
    /// keeps a trailing space so a request can never splice extra characters
    /// onto the executable name.
    pub compilers: BTreeMap<String, String>,
    pub platforms: BTreeSet<String>,
    pub languages: BTreeSet<String>,

    pub dump_shaders: bool,
    pub print_commands: bool,
    pub print_errors: bool,
    pub print_warnings: bool,
    pub print_list_updates: bool,
    pub dedupe_errors: bool,

    /// Consumed by the external mail reporter, carried here untouched.
    pub mail_interval: u64,
    pub fail_mail: String,
    pub mail_server: String,
    pub allow_elevated_permissions: bool,
}

impl Config {
    /// Defaults rooted at `root`, matching a stock deployment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Config {
            compiler_dir: root.join("Compiler"),
            cache_dir: root.join("Cache"),
            temp_dir: root.join("Temp"),
            error_dir: root.join("Error"),
            shader_dir: root.join("Shaders"),
            root,
            tcp_port: DEFAULT_TCP_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            caching: true,
            fallback_servers: Vec::new(),
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
            allow_list: Vec::new(),
            compilers: default_compiler_table(),
            platforms: default_platforms(),
            languages: default_languages(),
            dump_shaders: false,
            print_commands: false,
            print_errors: true,
            print_warnings: false,
            print_list_updates: true,
            dedupe_errors: true,
            mail_interval: 10,
            fail_mail: String::new(),
            mail_server: "example.com".to_string(),
            allow_elevated_permissions: false,
        }
    }

    /// Applies `key=value` overrides from an INI file. Unknown keys are
    /// logged and ignored so old config files keep working.
    pub fn apply_ini(&mut self, path: &Path) -> io::Result<()> {
        let text = std::fs::read_to_string(path)?;
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "ignoring malformed config line");
                continue;
            };
            self.apply_key(key.trim(), value.trim());
        }
        Ok(())
    }

    fn apply_key(&mut self, key: &str, value: &str) {
        match key.to_ascii_lowercase().as_str() {
            "port" => match value.parse() {
                Ok(port) => self.tcp_port = port,
                Err(_) => warn!(value, "invalid port value"),
            },
            "maxconnections" => match value.parse::<u32>() {
                Ok(n) if n > 0 => self.max_connections = n,
                _ => warn!(
                    value,
                    default = DEFAULT_MAX_CONNECTIONS,
                    "MaxConnections value is invalid, keeping default"
                ),
            },
            "caching" => self.caching = parse_flag(value),
            "tempdir" => self.temp_dir = PathBuf::from(value),
            "fallbackserver" => {
                self.fallback_servers = value
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "fallbacktreshold" => match value.parse() {
                Ok(n) => self.fallback_threshold = n,
                Err(_) => warn!(value, "invalid FallbackTreshold value"),
            },
            "whitelist" | "white_list" => {
                self.allow_list = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "dumpshaders" => self.dump_shaders = parse_flag(value),
            "printcommands" => self.print_commands = parse_flag(value),
            "printerrors" => self.print_errors = parse_flag(value),
            "printwarnings" => self.print_warnings = parse_flag(value),
            "printlistupdates" => self.print_list_updates = parse_flag(value),
            "dedupeerrors" => self.dedupe_errors = parse_flag(value),
            "mailerror" => self.fail_mail = value.to_string(),
            "mailinterval" => match value.parse() {
                Ok(n) => self.mail_interval = n,
                Err(_) => warn!(value, "invalid MailInterval value"),
            },
            "mailserver" => self.mail_server = value.to_string(),
            "allowelevatedpermissions" => self.allow_elevated_permissions = parse_flag(value),
            other => warn!(key = other, "unknown config key"),
        }
    }

    pub fn platform_is_valid(&self, platform: &str) -> bool {
        self.platforms.contains(platform)
    }

    pub fn language_is_valid(&self, language: &str) -> bool {
        self.languages.contains(language)
    }

    pub fn compiler_is_valid(&self, compiler: &str) -> bool {
        self.compilers.contains_key(compiler)
    }

    pub fn compiler_executable(&self, compiler: &str) -> Option<&str> {
        self.compilers.get(compiler).map(String::as_str)
    }
}

fn parse_flag(value: &str) -> bool {
    value.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

fn default_compiler_table() -> BTreeMap<String, String> {
    // Trailing spaces are intentional: the format string appended by the
    // client starts right after the executable, and the space stops a
    // request from extending the executable name.
    let mut table = BTreeMap::new();
    table.insert(
        compiler_id::D3D11_FXC.to_string(),
        "PCD3D11/v006/fxc.exe ".to_string(),
    );
    table.insert(
        compiler_id::GLSL_HLSLCC.to_string(),
        "PCGL/V006/HLSLcc ".to_string(),
    );
    table.insert(
        compiler_id::METAL_HLSLCC.to_string(),
        "PCGMETAL/HLSLcc/HLSLcc ".to_string(),
    );
    table.insert(
        compiler_id::GLSL_LLVM_DXC.to_string(),
        "LLVMGL/release/dxcGL ".to_string(),
    );
    table.insert(
        compiler_id::METAL_LLVM_DXC.to_string(),
        "LLVMMETAL/release/dxcMetal ".to_string(),
    );
    table
}

fn default_platforms() -> BTreeSet<String> {
    ["PC", "Mac", "iOS", "Android", "Linux"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_languages() -> BTreeSet<String> {
    [
        "D3D11", "METAL", "GL4", "GL4_1", "GL4_4", "GLES3", "GLES3_0", "GLES3_1",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
