//! Wire-level protocol constants shared by the codec, the dispatcher, and
//! the jobs.

/// Protocol revisions spoken by clients, ordered oldest to newest.
///
/// The ordering is load-bearing: several request attributes changed meaning
/// across revisions and the dispatcher gates on `>=` comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1,
    V2,
    V2_1,
    V2_2,
    V2_3,
}

impl ProtocolVersion {
    /// Maps the `Version` root attribute to a revision. Absent or unknown
    /// values fall back to the legacy V1 protocol.
    pub fn from_attribute(value: Option<&str>) -> Self {
        match value {
            Some("2.3") => ProtocolVersion::V2_3,
            Some("2.2") => ProtocolVersion::V2_2,
            Some("2.1") => ProtocolVersion::V2_1,
            Some("2.0") => ProtocolVersion::V2,
            _ => ProtocolVersion::V1,
        }
    }

    /// V2 and later append a one-byte job state to every response frame.
    pub fn has_state_byte(self) -> bool {
        self >= ProtocolVersion::V2
    }
}

/// Terminal state of a request, sent as the fifth byte of every V2+ response.
///
/// `Done` and `ErrorCompile` are checked numerically on the client side, so
/// their values are frozen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    None = 0,
    Done = 1,
    JobNotFound = 2,
    CacheHit = 3,
    Error = 4,
    ErrorCompile = 5,
    ErrorCompress = 6,
    ErrorFileIo = 7,
    ErrorInvalidProfile = 8,
    ErrorInvalidProject = 9,
    ErrorInvalidPlatform = 10,
    ErrorInvalidProgram = 11,
    ErrorInvalidEntry = 12,
    ErrorInvalidCompileFlags = 13,
    ErrorInvalidCompiler = 14,
    ErrorInvalidLanguage = 15,
    ErrorInvalidShaderRequestLine = 16,
    ErrorInvalidShaderList = 17,
}

impl JobState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_error(self) -> bool {
        self.code() >= JobState::Error.code()
    }
}
