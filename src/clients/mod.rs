// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Vendor collaborators: the door controller and the cloud service.

pub mod memory;
pub mod traits;

pub use memory::{MemoryCloud, MemoryController};
pub use traits::{
    ClientError, CloudClient, ControllerClient, Door, DoorEvent, DoorEventType, UnlockCommand,
};
