//! Map a registration's aliases to at most one catalog service.

use std::fmt;
use std::str::FromStr;

use kubecat_catalog::{CatalogClient, CatalogError, Service};
use serde::Serialize;
use tracing::debug;

/// When do two alias matches count as a conflict?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConflictPolicy {
    /// Only when the aliases resolve to different services.
    #[default]
    DistinctServices,
    /// Any second match, even of the same service.
    AnyMatch,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distinct-services" => Ok(ConflictPolicy::DistinctServices),
            "any-match" => Ok(ConflictPolicy::AnyMatch),
            other => Err(format!("unknown conflict policy '{}' (expected distinct-services or any-match)", other)),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::DistinctServices => f.write_str("distinct-services"),
            ConflictPolicy::AnyMatch => f.write_str("any-match"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolution {
    NoMatch,
    SingleMatch(Box<Service>),
    MultipleMatch { aliases: Vec<String>, ids: Vec<String> },
    LookupError { alias: String, error: CatalogError },
}

/// Look aliases up in order. Stops at the first lookup error or conflict.
pub async fn resolve(client: &dyn CatalogClient, aliases: &[String], policy: ConflictPolicy) -> IdentityResolution {
    let mut found: Option<(String, Service)> = None;
    for alias in aliases {
        let svc = match client.get_service(alias).await {
            Ok(Some(svc)) => svc,
            Ok(None) => continue,
            Err(error) => return IdentityResolution::LookupError { alias: alias.clone(), error },
        };
        match &found {
            None => {
                debug!(alias = %alias, id = %svc.id, "alias matched");
                found = Some((alias.clone(), svc));
            }
            Some((first_alias, first)) => {
                if policy == ConflictPolicy::AnyMatch || first.id != svc.id {
                    return IdentityResolution::MultipleMatch {
                        aliases: vec![first_alias.clone(), alias.clone()],
                        ids: vec![first.id.clone(), svc.id],
                    };
                }
            }
        }
    }
    match found {
        Some((_, svc)) => IdentityResolution::SingleMatch(Box::new(svc)),
        None => IdentityResolution::NoMatch,
    }
}
