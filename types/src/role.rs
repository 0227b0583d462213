// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of one of the two deployment colors of the worker fleet (for example
/// `blue` or `green`).
///
/// Role names appear in lease holder identities (`switch-<old>-to-<new>`) and
/// in intent record keys (`<prefix>-<role>-...`), so they must be non-empty
/// and must not contain whitespace or `/`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoleNameError {
    #[error("role name must not be empty")]
    Empty,
    #[error("role name {0:?} contains a forbidden character")]
    Forbidden(String),
}

impl RoleName {
    pub fn new(name: impl Into<String>) -> Result<Self, RoleNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RoleNameError::Empty);
        }
        if name.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(RoleNameError::Forbidden(name));
        }
        Ok(RoleName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoleName {
    type Err = RoleNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoleName::new(s)
    }
}

impl TryFrom<String> for RoleName {
    type Error = RoleNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RoleName::new(value)
    }
}

impl From<RoleName> for String {
    fn from(value: RoleName) -> Self {
        value.0
    }
}

/// Body of the watched active-role record, as read and written through the
/// controller's operator API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ActiveRole {
    pub active: RoleName,
}
