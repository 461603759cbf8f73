// Copyright (c) 2021-2023 Via Technology Ltd. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The runtime error type.
//!
//! Every variant maps onto an OpenCL error code via [`Error::code`], so the
//! classic `cl_int` surface is always recoverable. Network failures keep
//! their own variants because they propagate differently from argument
//! errors: during asynchronous transfers they become event statuses
//! instead of being returned.

use crate::types::{
    cl_int, CL_CONNECTION_ERROR, CL_INVALID_NODE_FILE, CL_IO_ERROR, CL_PROTOCOL_ERROR,
};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OpenCL error code, either raised locally by argument validation
    /// or forwarded from a compute node in a typed error response.
    #[error("OpenCL error {0}")]
    Cl(cl_int),

    /// A transport read/write failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A compute node could not be reached or disappeared.
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote side sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The node file could not be read or parsed.
    #[error("invalid node file: {0}")]
    NodeFile(String),
}

impl Error {
    /// The OpenCL error code for this error.
    pub fn code(&self) -> cl_int {
        match self {
            Self::Cl(code) => *code,
            Self::Io(_) => CL_IO_ERROR,
            Self::Connection(_) => CL_CONNECTION_ERROR,
            Self::Protocol(_) => CL_PROTOCOL_ERROR,
            Self::NodeFile(_) => CL_INVALID_NODE_FILE,
        }
    }
}

impl From<cl_int> for Error {
    fn from(code: cl_int) -> Self {
        Self::Cl(code)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CL_INVALID_VALUE;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Cl(CL_INVALID_VALUE).code(), CL_INVALID_VALUE);
        assert_eq!(Error::Io("read".into()).code(), CL_IO_ERROR);
        assert_eq!(Error::Protocol("tag".into()).code(), CL_PROTOCOL_ERROR);
        assert_eq!(Error::Connection("gone".into()).code(), CL_CONNECTION_ERROR);
        assert_eq!(Error::NodeFile("missing".into()).code(), CL_INVALID_NODE_FILE);
    }
}
