// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builds a persistable migration plan from a filtered inventory, and
//! derives a purely informational duration/cost/work-space estimate from
//! one (§4.3).

pub mod estimator;
pub mod plan_builder;

pub use estimator::{estimate, Estimate, VmShape};
pub use plan_builder::build_plan;
