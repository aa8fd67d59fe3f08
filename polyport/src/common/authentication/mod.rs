// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Types supporting authentication of proxied client sessions
mod traits;
pub use traits::*;

mod no_op_authentication;
pub use no_op_authentication::NoOpAuthenticationHandler;

mod ssh_authentication;
pub use ssh_authentication::SshAuthenticationHandler;
