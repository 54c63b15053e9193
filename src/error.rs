//  Copyright 2025 Larder Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::sync::Arc;

/// Error type of the cache loading paths.
///
/// The error is cheaply clonable so that a single load failure can be fanned
/// out to every waiter of an in-flight load.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The loader returned an error, panicked, or its task was aborted.
    ///
    /// No entry is retained for a failed load.
    #[error("load failed: {0}")]
    Load(Arc<dyn std::error::Error + Send + Sync>),
    /// The in-flight load this caller was waiting on went away without
    /// producing a value.
    #[error("load interrupted")]
    Interrupted,
}

impl Error {
    pub fn load(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Load(Arc::new(e))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Interrupted
    }
}

pub type Result<T> = std::result::Result<T, Error>;
