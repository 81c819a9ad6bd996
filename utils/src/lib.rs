// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the layercake crates: errno-style error macros, digest
//! computation, host command execution, bounded retries and logging setup.

#[macro_use]
extern crate log;

#[macro_use]
pub mod error;
pub use error::*;

pub mod digest;
pub mod exec;
pub mod logger;
pub mod reader;
pub mod retrier;

pub use exec::{CommandRunner, ExecError, ShellRunner};
pub use reader::{is_quota_exceeded, QuotaExceeded, QuotaedReader};
pub use retrier::{Clock, Retrier, SystemClock};
