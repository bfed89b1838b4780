//! Error types for the key data model
// Copyright 2025 Francisco F. Pinochet
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


use thiserror::Error;

/// Errors raised while converting key snapshots to and from their wire form
#[derive(Error, Debug)]
pub enum TypesError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown key repository: {0}")]
    UnknownRepository(String),

    #[error("Invalid key index: {0}")]
    InvalidIndex(String),

    #[error("Key {index} in {repository} is not valid UTF-8")]
    InvalidContent { repository: String, index: u32 },
}

pub type Result<T> = std::result::Result<T, TypesError>;
