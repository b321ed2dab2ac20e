// Copyright 2024 The Shardplane Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // business errors
    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("deadline exceeded {0}")]
    DeadlineExceeded(&'static str),

    #[error("no available team")]
    NoAvailableTeam,

    // internal errors
    #[error("invalid {0} data")]
    InvalidData(String),

    #[error("request canceled")]
    Canceled,

    #[error("service {0} is busy")]
    ServiceIsBusy(&'static str),

    // retryable errors
    #[error("transient metadata store failure: {0}")]
    TransientStore(String),

    #[error("move keys conflict: {0}")]
    MoveKeysConflict(String),

    #[error("team {0} vanished")]
    TeamVanished(String),

    #[error("rate keeper metrics missing: {0}")]
    MetricsUnavailable(&'static str),

    // fatal errors
    #[error("data distribution invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that a caller is expected to resolve by retrying with
    /// backoff, possibly after recomputing its inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientStore(_)
                | Error::MoveKeysConflict(_)
                | Error::DeadlineExceeded(_)
                | Error::ServiceIsBusy(_)
                | Error::NoAvailableTeam
        )
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::InvalidData(e.to_string())
    }
}
