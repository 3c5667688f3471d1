// Copyright 2025 Kestrel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Kestrel CLI
//!
//! Command-line interface for Kestrel RPC.
//!
//! ## Key Commands
//!
//! - `kestrel provider`: serve the demo `UserService` and keep it registered
//! - `kestrel call`: discover a service, call one method, print the JSON result
//!
//! ## Configuration
//!
//! Both commands resolve an [`RpcConfig`](kestrel_common::config::RpcConfig)
//! from, in increasing precedence:
//!
//! 1. built-in defaults
//! 2. `application.toml` in the config directory (`[rpc]` table)
//! 3. `application-{profile}.toml` when a profile is given
//! 4. `KESTREL__RPC__*` environment variables (`__` separates nesting levels)
//! 5. command-line flags

pub mod demo;
pub mod settings;

pub use settings::{load_config, ConfigLoader};
