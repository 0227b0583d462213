// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out HTTP primitives against a set of worker endpoints.
//!
//! [`FleetProber`] has no state of its own beyond an HTTP client: every call
//! issues one request per endpoint, concurrently and with an independent
//! timeout, and reports the outcome for every endpoint it was given. A
//! failure on one endpoint never cancels the requests to its siblings.

mod errors;
mod fan_out;
mod prober;

pub use errors::{EndpointError, FanOutError, WaitError};
pub use fan_out::{FanOut, DEFAULT_MAX_CONCURRENCY};
pub use prober::{FleetProber, ProbeReport, DEFAULT_REQUEST_TIMEOUT};
