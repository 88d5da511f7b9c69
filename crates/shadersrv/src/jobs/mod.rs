//! The three job kinds a request can dispatch to.

pub mod compile;
pub mod get_shader_list;
pub mod request_line;

use std::collections::HashMap;

use crate::protocol::JobState;

/// Root-element attributes of the request XML.
pub type Attributes = HashMap<String, String>;

/// A job that did not reach `Done`: the terminal state for the response
/// frame, plus an optional message. Validation failures stay silent (empty
/// body); compiler and compression failures carry their diagnostics back to
/// the client.
#[derive(Debug)]
pub struct JobError {
    pub state: JobState,
    pub message: Option<String>,
}

impl JobError {
    pub fn new(state: JobState) -> Self {
        JobError {
            state,
            message: None,
        }
    }

    pub fn with_message(state: JobState, message: impl Into<String>) -> Self {
        JobError {
            state,
            message: Some(message.into()),
        }
    }
}

pub(crate) fn attr<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a str> {
    attrs.get(name).map(String::as_str)
}

pub(crate) fn required_attr<'a>(
    attrs: &'a Attributes,
    name: &str,
    missing: JobState,
) -> Result<&'a str, JobError> {
    attr(attrs, name).ok_or_else(|| JobError::new(missing))
}
