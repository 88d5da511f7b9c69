use std::{io, time::Duration};

use thiserror::Error;

/// Errors that may occur while serving shader-compilation requests.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("frame size {size} is outside 1..={max}")]
    InvalidFrameSize { size: u64, max: u64 },
    #[error("peer sent no data within {budget:?}")]
    RecvTimeout { budget: Duration },
    #[error("failed to read from socket: {source}")]
    SocketRead {
        #[source]
        source: io::Error,
    },
    #[error("failed to write to socket: {source}")]
    SocketWrite {
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to peer `{peer}`: {source}")]
    PeerConnect {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("request payload is not valid UTF-8: {0}")]
    PayloadUtf8(#[from] std::str::Utf8Error),
    #[error("failed to parse request XML: {0}")]
    XmlParse(#[from] quick_xml::Error),
    #[error("malformed attribute in request XML: {0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("request XML has no root element")]
    MissingRootElement,
    #[error("failed to compress data: {source}")]
    Compress {
        #[source]
        source: io::Error,
    },
    #[error("failed to decompress data")]
    Decompress,
    #[error("could not spawn shell for `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for compiler process: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },
    #[error("could not bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}
