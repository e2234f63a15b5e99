// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("remote end closed connection")]
    Closed,
    #[error("incorrect message size: expected {expected} bytes, received {received}")]
    ShortMessage { expected: usize, received: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context field {0} is already registered")]
    AlreadyExists(&'static str),
    #[error("out of memory while appending context field")]
    OutOfMemory,
}
