// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture page-table implementations of [`crate::hal::Pmap`].

pub mod sv39;
