//! Turns one received payload into one framed response.

use std::{net::Ipv4Addr, sync::Arc};

use quick_xml::{events::Event, Reader};
use tracing::warn;

use crate::{
    compress,
    config::Config,
    error::ServerError,
    jobs::{self, Attributes, JobError},
    protocol::{JobState, ProtocolVersion},
    server::Server,
};

/// Sent back for the `Identify` discovery ping.
pub const IDENTIFY_RESPONSE: &str = "ShaderCompilerServer";

/// A fully decided response, ready for the codec.
pub struct Reply {
    pub version: ProtocolVersion,
    pub state: JobState,
    pub body: Vec<u8>,
}

/// Extracts the attribute map of the request's root element.
pub fn parse_root_attributes(payload: &[u8]) -> Result<Attributes, ServerError> {
    let text = std::str::from_utf8(payload)?;
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event()? {
            Event::Start(element) | Event::Empty(element) => {
                let mut attrs = Attributes::new();
                for attribute in element.attributes() {
                    let attribute = attribute?;
                    let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                    let value = attribute.unescape_value()?.into_owned();
                    attrs.insert(key, value);
                }
                return Ok(attrs);
            }
            Event::Eof => return Err(ServerError::MissingRootElement),
            _ => continue,
        }
    }
}

/// Parses, validates, and runs the request, reducing every outcome to a
/// [`Reply`]. Worker faults never escape this function.
pub async fn handle_request(server: &Arc<Server>, payload: Vec<u8>, peer: Ipv4Addr) -> Reply {
    let attrs = match parse_root_attributes(&payload) {
        Ok(attrs) => attrs,
        Err(error) => {
            return failed(
                server,
                ProtocolVersion::V1,
                JobError::with_message(
                    JobState::ErrorCompile,
                    format!("failed to parse request XML: {error}"),
                ),
            );
        }
    };

    let version = ProtocolVersion::from_attribute(attrs.get("Version").map(String::as_str));

    // Server discovery ping: answer with our name and nothing else.
    if attrs.contains_key("Identify") {
        return Reply {
            version,
            state: JobState::Done,
            body: IDENTIFY_RESPONSE.as_bytes().to_vec(),
        };
    }

    server.count_request();

    let job_type = attrs.get("JobType").map(String::as_str);

    // GetShaderList requests carry no target attributes; everything else is
    // validated before a job runs.
    let is_get_shader_list = job_type
        .map(|name| name.eq_ignore_ascii_case("GetShaderList"))
        .unwrap_or(false);
    if !is_get_shader_list {
        if let Err(error) = validate_target_attributes(&server.config, &attrs, version) {
            return failed(server, version, error);
        }
    }

    if version >= ProtocolVersion::V2 {
        let Some(job_type) = job_type else {
            warn!("request is version 2.0 or higher but has no JobType");
            return failed(server, version, JobError::new(JobState::JobNotFound));
        };
        match job_type {
            "RequestLine" => match jobs::request_line::run(server, &attrs, version) {
                Ok(body) => done(version, body),
                Err(error) => failed(server, version, error),
            },
            "Compile" => match jobs::compile::run(server, &attrs, version, &payload, peer).await {
                Ok(body) => done(version, body),
                Err(error) => failed(server, version, error),
            },
            "GetShaderList" => match jobs::get_shader_list::run(server, &attrs).await {
                Ok(body) => done(version, body),
                Err(error) => failed(server, version, error),
            },
            other => {
                warn!(job_type = other, "requested unknown job");
                failed(server, version, JobError::new(JobState::JobNotFound))
            }
        }
    } else {
        // Legacy requests are always compiles.
        match jobs::compile::run(server, &attrs, ProtocolVersion::V1, &payload, peer).await {
            Ok(body) => done(ProtocolVersion::V1, body),
            Err(error) => failed(server, ProtocolVersion::V1, error),
        }
    }
}

fn validate_target_attributes(
    config: &Config,
    attrs: &Attributes,
    version: ProtocolVersion,
) -> Result<(), JobError> {
    if version >= ProtocolVersion::V2_3 {
        match attrs.get("Platform") {
            Some(platform) if config.platform_is_valid(platform) => {}
            _ => return Err(JobError::new(JobState::ErrorInvalidPlatform)),
        }
        match attrs.get("Compiler") {
            Some(compiler) if config.compiler_is_valid(compiler) => {}
            _ => return Err(JobError::new(JobState::ErrorInvalidCompiler)),
        }
        match attrs.get("Language") {
            Some(language) if config.language_is_valid(language) => {}
            _ => return Err(JobError::new(JobState::ErrorInvalidLanguage)),
        }
    } else {
        // Overloaded meaning before V2_3; each job interprets the value,
        // but it has to be there.
        if !attrs.contains_key("Platform") {
            return Err(JobError::new(JobState::ErrorInvalidPlatform));
        }
    }
    Ok(())
}

fn done(version: ProtocolVersion, body: Vec<u8>) -> Reply {
    Reply {
        version,
        state: JobState::Done,
        body,
    }
}

fn failed(server: &Server, version: ProtocolVersion, error: JobError) -> Reply {
    server.count_exception();
    warn!(state = ?error.state, message = error.message.as_deref().unwrap_or(""), "request failed");
    let body = match &error.message {
        Some(message) => error_body(message),
        None => Vec::new(),
    };
    Reply {
        version,
        state: error.state,
        body,
    }
}

/// Error bodies travel like compile results: NUL-terminated text, deflated.
fn error_body(message: &str) -> Vec<u8> {
    let mut raw = message.as_bytes().to_vec();
    raw.push(0);
    compress::deflate(&raw).unwrap_or_default()
}
