// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A self-hosted tunneling proxy which detects SOCKS5, HTTP `CONNECT`, and WebSocket-upgrade
//! clients on a single port, plus a supervisor for running many such listeners in the background

pub mod common;
pub mod config;
pub mod server;
pub mod supervisor;
pub mod util;
