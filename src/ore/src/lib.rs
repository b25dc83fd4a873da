// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility libraries for the tenant control plane.
//!
//! **ore** (_n_): the raw material from which more valuable materials are extracted.
//! Modules are included in this crate when they are broadly useful but too
//! small to warrant their own crate.

#![deny(missing_docs, missing_debug_implementations)]

// Lets `#[mz_ore::test]` expand to `::mz_ore::...` paths inside this crate.
extern crate self as mz_ore;

pub mod retry;
pub mod stopper;
pub mod task;
pub mod time;
pub mod tracing;

pub use mz_ore_proc::test;
