//! Returns a persisted shader list to the client.

use crate::{compress, protocol::JobState, server::Server};

use super::{attr, Attributes, JobError};

/// Reads the target's list file and returns it deflated. A list that does
/// not exist yet is not an error: the client gets four zero bytes, the
/// compressed form of "nothing recorded so far".
pub async fn run(server: &Server, attrs: &Attributes) -> Result<Vec<u8>, JobError> {
    let project = attr(attrs, "Project").unwrap_or_default();
    let platform = attr(attrs, "Platform").unwrap_or_default();
    let compiler = attr(attrs, "Compiler").unwrap_or_default();
    let language = attr(attrs, "Language").unwrap_or_default();
    let shader_list = attr(attrs, "ShaderList").unwrap_or_default();

    let name = format!("{project}{platform}-{compiler}-{language}/{shader_list}");
    let path = server.lists.path_of(&name);

    let raw = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(_) => return Ok(vec![0u8; 4]),
    };

    compress::deflate(&raw)
        .map_err(|_| JobError::with_message(JobState::ErrorCompress, "failed to compress request"))
}
