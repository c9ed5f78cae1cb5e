// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Disk-adaptation sub-engines that mutate a guest image so it boots
//! under the target hypervisor: offline Linux edits, the Windows virtio
//! driver-store install via a controlled emulator boot, and the
//! BIOS→UEFI conversion for both guest families (§4.5-§4.7).

pub mod bios2uefi;
pub mod error;
pub mod linux_adapter;
pub mod windows_adapter;

pub use error::{AdapterError, AdapterResult};
