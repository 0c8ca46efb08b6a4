// Copyright (c) 2023 The TCPCC Authors.
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

//! Error type for congestion control operations.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Congestion control error.
///
/// Protocol anomalies (stale acks, ancient SACK blocks) are handled locally
/// by the component that detects them and never surface here; the congestion
/// engine must not abort an otherwise-healthy connection over bookkeeping
/// noise. Only configuration errors are hard errors.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The engine encountered an internal error and cannot continue
    /// processing the current event.
    #[default]
    InternalError,

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The operation on the connection is invalid.
    InvalidOperation(String),

    /// The configuration is invalid. This is the only error surfaced at
    /// connection construction time.
    InvalidConfig(String),

    /// There is no more work to do. Used for an incoming ack that is wholly
    /// stale or outside the window and mutates no state.
    Done,
}

impl Error {
    /// Return the error number used by external callers.
    pub(crate) fn to_errno(&self) -> i64 {
        match self {
            Error::InternalError => -1,
            Error::InvalidState(_) => -2,
            Error::InvalidOperation(_) => -3,
            Error::InvalidConfig(_) => -4,
            Error::Done => -100,
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
