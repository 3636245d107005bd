// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Test discovery types (§4.M, §6 "Loader"). `include/moonunit/test.h`'s
//! `MuTest`/`MuFixtureSetup`/`MuFixtureTeardown`/`MuLibrarySetup`/
//! `MuLibraryTeardown` described a dynamically-loaded `.so` and its
//! discoverable symbols; this crate has no dynamic loader of its own (§1
//! "Non-goals" excludes plugin discovery), so a [`Loader`] is instead the
//! seam a consumer implements to supply already-resolved test functions --
//! statically registered, discovered via `inventory`-style linkage, or
//! whatever fits the embedding binary.

use natest_ipc::protocol::TestStatus;
use std::fmt;
use std::sync::Arc;

/// Identifies one test's place in its suite and source (mirrors `MuTest`'s
/// `suite`/`name`/`file`/`line` fields).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestDescriptor {
    pub suite: String,
    pub name: String,
    pub file: String,
    pub line: u32,
}

impl fmt::Display for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} ({}:{})", self.suite, self.name, self.file, self.line)
    }
}

/// Opaque handle to a library grouping of tests (mirrors `MuLibrary`).
/// Here it is nothing more than a name: this crate does not itself load
/// shared objects, so there is no file descriptor or symbol table to hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LibraryHandle {
    pub path: String,
}

/// A fixture or library setup/teardown thunk, run on the same side (forked
/// child or in-process) as the test body it brackets. Boxed rather than a
/// bare function pointer because real loaders close over loaded-library
/// state (mirrors `MuFixtureSetup::run`/`MuFixtureTeardown::run`).
pub type Thunk = Arc<dyn Fn(&mut dyn crate::token::Token) + Send + Sync>;

/// One runnable test (mirrors `MuTest` plus the fixture thunks a loader
/// resolves for it).
#[derive(Clone)]
pub struct Test {
    pub descriptor: TestDescriptor,
    pub setup: Option<Thunk>,
    pub run: Thunk,
    pub teardown: Option<Thunk>,
}

/// Declares the non-`Success` status a test expects to end with, set by
/// the test body itself at run time via
/// [`crate::token::Token::set_expectation`] (mirrors `MU_EXPECT`, see
/// `include/moonunit/interface.h`). Kept here rather than as a static field
/// of [`Test`] because the original macro is called from inside the
/// running test, not known in advance by the loader.
pub type ExpectedStatus = TestStatus;

/// A library-level setup or teardown thunk, run once per library rather
/// than once per test (mirrors `MuLibrarySetup`/`MuLibraryTeardown`). Takes
/// no token and produces no [`crate::result::TestResult`] of its own: a
/// panic here is caught by [`crate::runner::run_library`] and reported
/// through [`crate::result::Logger::library_fail`] instead, which aborts
/// the whole library rather than classifying as a test result.
pub type LibraryThunk = Arc<dyn Fn() + Send + Sync>;

/// Resolves a [`LibraryHandle`] into its tests and library-level fixtures
/// (§6 "Loader"). Implemented by the embedding binary; this crate ships no
/// implementation of its own.
///
/// `open`/`close`/`name` and `construct`/`destruct` round out the full
/// consumed interface named in SPEC_FULL.md §6 even though
/// [`crate::runner::run_library`] itself only calls `open`/`construct` once
/// up front and `destruct`/`close` once at the end -- symbol discovery and
/// dynamic-library loading stay the embedding binary's job (§1
/// "Non-goals"), this crate only needs somewhere to call into it.
/// `fixture_setup`/`fixture_teardown` default to `None`: this crate expects
/// a [`Loader`] to resolve a suite's fixture thunks directly into each
/// [`Test`]'s own `setup`/`teardown` fields when building the list
/// `tests()` returns, so every dispatched test (any suite) is bracketed the
/// same way regardless of where its loader actually keeps the fixture --
/// the two methods stay on the trait only so a [`Loader`] that resolves
/// fixtures lazily, per suite, has a seam to do it through.
pub trait Loader: Send + Sync {
    /// Resolves `path` (whatever the embedding binary uses to locate a
    /// compiled test artifact) into a [`LibraryHandle`]. This crate never
    /// calls this with anything but the path [`crate::runner::run`] was
    /// given.
    fn open(&self, path: &str) -> anyhow::Result<LibraryHandle> {
        Ok(LibraryHandle {
            path: path.to_string(),
        })
    }

    /// Releases whatever `open` acquired. Called exactly once, after the
    /// last test in `library` has finished (including `destruct`).
    fn close(&self, _library: LibraryHandle) {}

    /// A human-readable name for `library`, for a logger that wants
    /// something nicer than the raw path `open` was given.
    fn name<'a>(&self, library: &'a LibraryHandle) -> &'a str {
        &library.path
    }

    fn tests(&self, library: &LibraryHandle) -> Vec<Test>;
    fn library_setup(&self, library: &LibraryHandle) -> Option<LibraryThunk>;
    fn library_teardown(&self, library: &LibraryHandle) -> Option<LibraryThunk>;

    /// Fixture thunks for `suite`, keyed by name, for a [`Loader`] that
    /// would rather hand these back lazily than bake them into every
    /// [`Test`] it returns from `tests()`. Not called by
    /// [`crate::runner::run_library`] today -- see the trait-level doc.
    fn fixture_setup(&self, _library: &LibraryHandle, _suite: &str) -> Option<Thunk> {
        None
    }
    fn fixture_teardown(&self, _library: &LibraryHandle, _suite: &str) -> Option<Thunk> {
        None
    }

    /// One-shot in-process initialization for `library`, run under an
    /// in-process [`crate::token::Token`] regardless of
    /// [`crate::config::EngineConfig::debug_mode`] -- distinct from
    /// `library_setup`, which (per this crate's choice, see DESIGN.md) runs
    /// as a plain closure with no token at all. A loader with nothing to do
    /// here need not override it.
    fn construct(
        &self,
        _library: &LibraryHandle,
        _token: &mut dyn crate::token::Token,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The `construct` counterpart, run once after every test (and
    /// `library_teardown`) has finished.
    fn destruct(
        &self,
        _library: &LibraryHandle,
        _token: &mut dyn crate::token::Token,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_display_matches_suite_name_file_line() {
        let d = TestDescriptor {
            suite: "strings".to_string(),
            name: "reverse".to_string(),
            file: "strings_test.rs".to_string(),
            line: 12,
        };
        assert_eq!(d.to_string(), "strings::reverse (strings_test.rs:12)");
    }
}
