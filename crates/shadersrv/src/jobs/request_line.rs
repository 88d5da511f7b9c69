//! Records shader permutations clients intend to request later.

use crate::{
    protocol::{JobState, ProtocolVersion},
    server::Server,
};

use super::{attr, required_attr, Attributes, JobError};

/// Splits the `ShaderRequest` attribute on `;` and queues every token for
/// the target's list file. The response body is empty; validation of the
/// individual lines happens at save time.
pub fn run(
    server: &Server,
    attrs: &Attributes,
    version: ProtocolVersion,
) -> Result<Vec<u8>, JobError> {
    let request = required_attr(attrs, "ShaderRequest", JobState::ErrorInvalidShaderRequestLine)?;

    let list_name = if version >= ProtocolVersion::V2_3 {
        let project = required_attr(attrs, "Project", JobState::ErrorInvalidProject)?;
        let shader_list = required_attr(attrs, "ShaderList", JobState::ErrorInvalidShaderList)?;
        // Platform/Compiler/Language were validated by the dispatcher.
        let platform = attr(attrs, "Platform").unwrap_or_default();
        let compiler = attr(attrs, "Compiler").unwrap_or_default();
        let language = attr(attrs, "Language").unwrap_or_default();
        format!("{project}{platform}-{compiler}-{language}/{shader_list}")
    } else {
        // Older clients send the list filename in the Platform attribute.
        required_attr(attrs, "Platform", JobState::ErrorInvalidPlatform)?.to_string()
    };

    for token in request.split(';').filter(|token| !token.is_empty()) {
        server.lists.add(&list_name, token);
    }

    Ok(Vec::new())
}
