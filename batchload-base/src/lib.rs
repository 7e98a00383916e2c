// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Platform abstractions and ambient utilities shared by the batchload crates.
//!
//! Everything here works both natively (on top of Tokio) and in the browser, where the
//! batch processors run inside an extension's injected context.

#[cfg(with_metrics)]
pub mod prometheus_util;
pub mod task;
pub mod time;
#[cfg(not(target_arch = "wasm32"))]
pub mod tracing;
#[cfg(web)]
pub mod tracing_web;
pub mod util;
