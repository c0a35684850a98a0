// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::group::Ctx;
use futures::future::BoxFuture;
use fvm_ipld_encoding::Cbor;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Outcome of consulting the transition table for a `(state, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Move to the given state and run its entry handler.
    To(S),
    /// Stay in the current state but run its entry handler again.
    NoChange,
    /// Apply the event's mutation without transitioning or running a handler.
    JustRecord,
}

/// Declaration of one side of one market: the record schema, its state and
/// event taxonomy, the transition table and the per-state entry handlers.
pub trait Machine: Sized + Send + Sync + 'static {
    /// Identity field of the record (`ProposalCid` or deal id).
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type State: Copy + PartialEq + fmt::Debug + Send + Sync + 'static;
    type Event: Clone + fmt::Debug + Send + Sync + 'static;
    type Record: Cbor + Clone + Send + Sync + 'static;
    /// Dependencies available to entry handlers.
    type Environment: Send + Sync + 'static;

    fn key(record: &Self::Record) -> Self::Key;
    fn state(record: &Self::Record) -> Self::State;
    fn set_state(record: &mut Self::Record, state: Self::State);

    /// Finality states absorb: no event is accepted once one is reached.
    fn is_final(state: Self::State) -> bool;

    /// The declarative transition table. `None` drops the event with a
    /// warning.
    fn plan(state: Self::State, event: &Self::Event) -> Option<Transition<Self::State>>;

    /// Mutates the record with the event's arguments. Must not block.
    fn apply(record: &mut Self::Record, event: &Self::Event);

    /// Entry handler for the record's current state. States without a
    /// handler return an immediately-ready `Ok(())`.
    fn handle(
        env: Arc<Self::Environment>,
        ctx: Ctx<Self>,
        record: Self::Record,
    ) -> BoxFuture<'static, Result<(), String>>;
}
