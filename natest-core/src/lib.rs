// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Test execution engine: loader/logger traits, the child-side and
//! in-process test tokens, the fork dispatcher, signal-based crash
//! detection, iteration policy, and engine configuration.
//!
//! Everything in this crate is concerned with *running* a test once its
//! descriptor is known; getting bytes between the parent and child
//! processes is `natest-ipc`'s job, and discovering tests inside a
//! compiled artifact is an external collaborator's (§1 "Out of scope").

pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod iteration;
pub mod logging;
pub mod result;
pub mod runner;
pub mod signals;
pub mod token;

pub use config::EngineConfig;
pub use descriptor::{LibraryHandle, Loader, Test, TestDescriptor};
pub use dispatcher::{dispatch, run_test};
pub use iteration::{run_iterations, IterationOutcome};
pub use result::{LogEvent, Logger, LoggerOption, TestResult};
pub use runner::{run, run_library, TestOutcome};
pub use token::Token;
