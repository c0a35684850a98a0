// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A persistent table of state machines keyed by a record identity field.
//!
//! Each market side declares a [`Machine`]: the record type, its state and
//! event enums, a declarative transition planner, a mutation action per event
//! and an entry handler per state. A [`StateGroup`] then owns the live table:
//! it applies events one at a time per key, persists every post-state before
//! acknowledging the sender, notifies subscribers, and runs the entry handler
//! for the new state. Handlers for different keys run in parallel; a handler
//! must never read its own record back through the group (it would wait on
//! its own worker) and instead spawns a task that triggers a follow-up event.

mod errors;
mod group;
mod machine;
mod migrate;

pub use errors::Error;
pub use group::{Ctx, StateGroup};
pub use machine::{Machine, Transition};
pub use migrate::{MigrationFn, Migrations};
