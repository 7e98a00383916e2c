// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batch processors for the concrete resource domains.

pub mod assets;
pub mod profiles;
pub mod thumbnails;

#[cfg(test)]
#[path = "../unit_tests/resources_tests.rs"]
mod resources_tests;
