// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Utilities used throughout the batchload codebase.
*/

pub mod traits;
