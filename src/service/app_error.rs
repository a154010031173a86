// Copyright 2025 jonefeewang@gmail.com
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

use std::net::SocketAddr;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),

    /// marker error, more bytes are needed before a frame can be parsed
    #[error("incomplete frame")]
    Incomplete,

    /// protocol errors
    #[error("framing error: {0}")]
    FramingError(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// session registry errors
    #[error("no session for peer {0}")]
    UnknownPeer(SocketAddr),

    #[error("session for peer {0} already exists")]
    SessionExists(SocketAddr),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(value: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::ChannelSendError(value.to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for AppError {
    fn from(value: async_channel::SendError<T>) -> Self {
        AppError::ChannelSendError(value.to_string())
    }
}

impl<T> From<tokio::sync::broadcast::error::SendError<T>> for AppError {
    fn from(value: tokio::sync::broadcast::error::SendError<T>) -> Self {
        AppError::ChannelSendError(value.to_string())
    }
}
