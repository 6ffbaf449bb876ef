// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// An error that occurs while parsing a [`Seed`](crate::Seed) from a string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid seed `{input}`: expected up to 32 hexadecimal digits, optionally prefixed by 0x")]
pub struct SeedParseError {
    input: String,
}

impl SeedParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }

    /// Returns the input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// An error that occurs while decoding a protocol line.
#[derive(Debug, Error)]
#[error("failed to decode protocol message `{line}`")]
pub struct ProtocolDecodeError {
    line: String,
    #[source]
    err: serde_json::Error,
}

impl ProtocolDecodeError {
    pub(crate) fn new(line: &str, err: serde_json::Error) -> Self {
        Self {
            line: line.trim_end().to_owned(),
            err,
        }
    }
}
