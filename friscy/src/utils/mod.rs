// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Utilities shared across the friscy crates.

pub mod rng;
