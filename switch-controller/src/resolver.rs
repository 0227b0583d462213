// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping roles to the endpoints of their workers.

use crate::config::RoleConfig;
use async_trait::async_trait;
use cutover_types::{RoleName, WorkerEndpoint};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("role {0} is not configured")]
    UnknownRole(RoleName),
    #[error("no endpoints found for service {service} (role {role})")]
    NoEndpoints { role: RoleName, service: String },
    #[error("invalid host {host:?} for role {role}")]
    InvalidHost { role: RoleName, host: String },
}

/// Resolves the lifecycle endpoints of a role's workers. Called afresh at
/// the start of every switch.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(
        &self,
        role: &RoleName,
    ) -> Result<Vec<WorkerEndpoint>, ResolveError>;
}

/// Resolves roles from a fixed (but replaceable) membership table.
#[derive(Debug)]
pub struct StaticResolver {
    roles: RwLock<BTreeMap<RoleName, RoleConfig>>,
    lifecycle_port: u16,
}

impl StaticResolver {
    pub fn new(
        roles: BTreeMap<RoleName, RoleConfig>,
        lifecycle_port: u16,
    ) -> StaticResolver {
        StaticResolver { roles: RwLock::new(roles), lifecycle_port }
    }

    /// Replaces the membership of `role`.
    pub fn set_role(&self, role: RoleName, config: RoleConfig) {
        let mut roles = match self.roles.write() {
            Ok(roles) => roles,
            Err(poisoned) => poisoned.into_inner(),
        };
        roles.insert(role, config);
    }

    fn endpoint(
        &self,
        role: &RoleName,
        host: &str,
    ) -> Result<WorkerEndpoint, ResolveError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ResolveError::InvalidHost {
                role: role.clone(),
                host: host.to_string(),
            });
        }
        if let Ok(endpoint) = host.parse::<WorkerEndpoint>() {
            return Ok(endpoint);
        }
        if host.contains(':') && !host.contains("::") {
            // Looks like `host:port` but the port did not parse.
            return Err(ResolveError::InvalidHost {
                role: role.clone(),
                host: host.to_string(),
            });
        }
        Ok(WorkerEndpoint::new(host, self.lifecycle_port))
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(
        &self,
        role: &RoleName,
    ) -> Result<Vec<WorkerEndpoint>, ResolveError> {
        let config = {
            let roles = match self.roles.read() {
                Ok(roles) => roles,
                Err(poisoned) => poisoned.into_inner(),
            };
            roles
                .get(role)
                .cloned()
                .ok_or_else(|| ResolveError::UnknownRole(role.clone()))?
        };
        let mut endpoints = config
            .hosts
            .iter()
            .map(|host| self.endpoint(role, host))
            .collect::<Result<Vec<_>, _>>()?;
        endpoints.sort();
        endpoints.dedup();
        if endpoints.is_empty() {
            return Err(ResolveError::NoEndpoints {
                role: role.clone(),
                service: config.service,
            });
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn role(name: &str) -> RoleName {
        RoleName::new(name).unwrap()
    }

    fn resolver() -> StaticResolver {
        StaticResolver::new(
            BTreeMap::from([
                (
                    role("blue"),
                    RoleConfig {
                        service: "consumer-blue".to_string(),
                        hosts: vec![
                            "10.0.0.2".to_string(),
                            "10.0.0.1:9000".to_string(),
                            "10.0.0.2".to_string(),
                        ],
                    },
                ),
                (
                    role("green"),
                    RoleConfig {
                        service: "consumer-green".to_string(),
                        hosts: vec![],
                    },
                ),
            ]),
            8080,
        )
    }

    #[tokio::test]
    async fn resolves_hosts_with_default_port() {
        let endpoints = resolver().resolve(&role("blue")).await.unwrap();
        assert_eq!(
            endpoints,
            vec![
                WorkerEndpoint::new("10.0.0.1", 9000),
                WorkerEndpoint::new("10.0.0.2", 8080),
            ]
        );
    }

    #[tokio::test]
    async fn empty_and_unknown_roles_fail() {
        let resolver = resolver();
        assert_matches!(
            resolver.resolve(&role("green")).await,
            Err(ResolveError::NoEndpoints { service, .. })
                if service == "consumer-green"
        );
        assert_matches!(
            resolver.resolve(&role("red")).await,
            Err(ResolveError::UnknownRole(_))
        );

        resolver.set_role(
            role("green"),
            RoleConfig {
                service: "consumer-green".to_string(),
                hosts: vec!["10.0.1.1:http".to_string()],
            },
        );
        assert_matches!(
            resolver.resolve(&role("green")).await,
            Err(ResolveError::InvalidHost { .. })
        );
    }
}
