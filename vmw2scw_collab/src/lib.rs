// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Port traits for everything the core treats as an external collaborator
//! (§6): source inventory, source management session, target API, object
//! store, and the progress event sink — plus deterministic fakes used by
//! this crate's and downstream crates' end-to-end tests.

pub mod fakes;
pub mod http;
pub mod ports;

pub use ports::{
    CollabError, CollabResult, ExportLease, InventorySource, NullProgressSink, ObjectStore, ProgressSink,
    RemoteState, SourceSession, TargetClient,
};
