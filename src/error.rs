// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for loss recovery operations.

use strum_macros::EnumIter;

/// Loss recovery error.
///
/// Loss detection itself never fails. These errors are raised by the
/// bookkeeping around it when a caller hands in input that would break the
/// invariants of the sent segment store.
#[derive(Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The configuration is invalid.
    InvalidConfig(String),

    /// A segment with an empty sequence range was submitted.
    InvalidSegment,

    /// A cumulative acknowledgment covers data that was never sent.
    InvalidAck,

    /// The segment handle does not refer to an outstanding segment.
    UnknownSegment,
}

impl Error {
    /// Return a negative error code that is distinct for each kind of
    /// error and stable across releases.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::InvalidConfig(_) => -1,
            Error::InvalidSegment => -2,
            Error::InvalidAck => -3,
            Error::UnknownSegment => -4,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
