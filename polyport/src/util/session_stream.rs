// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream carrying one client session, whether raw TCP, TLS, or in-memory
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SessionStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedSessionStream = Box<dyn SessionStream + 'static>;
