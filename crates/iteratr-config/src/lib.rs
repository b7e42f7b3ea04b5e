// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::load;
pub use schema::{AgentCommandConfig, Config, DEFAULT_DATA_DIR, DEFAULT_SPEC_PATH};
