// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the switch controller, the switch sidecar, and the worker
//! lifecycle surface they both drive.

pub mod desired;
pub mod endpoint;
pub mod lifecycle;
pub mod role;

pub use desired::{DesiredState, FaultConfig, FaultSetting, PushAccepted};
pub use endpoint::{ParseEndpointError, WorkerEndpoint};
pub use lifecycle::{LifecycleCommand, LifecycleState, StatusResponse};
pub use role::{ActiveRole, RoleName, RoleNameError};
