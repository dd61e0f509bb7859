//! Effective resource request reduction
//!
//! Reduces a pod's container list to the request the scheduler reserves:
//!
//! - app containers run concurrently, so their requests are summed
//! - init containers run one at a time in declared order; a restartable
//!   init container keeps running once started, so every later init
//!   container runs on top of the restartable ones started before it
//! - the pod reserves the larger of the app sum and the init peak
//!
//! This module is pure: no I/O and no state.

use crate::models::{ContainerKind, ContainerSpec, EffectiveRequest};
use crate::quantity::{Quantity, QuantityError};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while reducing a container list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    #[error("malformed quantity for {resource} in container {container}: {source}")]
    MalformedQuantity {
        container: String,
        resource: String,
        #[source]
        source: QuantityError,
    },
}

/// Compute the effective request of an ordered container list
pub fn effective_request(containers: &[ContainerSpec]) -> Result<EffectiveRequest, ReduceError> {
    let mut app_sum: BTreeMap<String, Quantity> = BTreeMap::new();
    let mut restartable_sum: BTreeMap<String, Quantity> = BTreeMap::new();
    let mut init_peak: BTreeMap<String, Quantity> = BTreeMap::new();

    for container in containers {
        let requests = parse_requests(container)?;

        match container.kind {
            ContainerKind::App => {
                for (resource, quantity) in requests {
                    let total = app_sum.entry(resource.clone()).or_default();
                    *total = add(container, &resource, *total, quantity)?;
                }
            }
            ContainerKind::Init => {
                for (resource, quantity) in requests {
                    let running = restartable_sum.get(&resource).copied().unwrap_or_default();
                    let candidate = add(container, &resource, running, quantity)?;
                    raise(&mut init_peak, resource, candidate);
                }
            }
            ContainerKind::Sidecar => {
                for (resource, quantity) in requests {
                    let running = restartable_sum.entry(resource.clone()).or_default();
                    *running = add(container, &resource, *running, quantity)?;
                    let candidate = *running;
                    raise(&mut init_peak, resource, candidate);
                }
            }
        }
    }

    // A non-restartable init container without a request for some resource
    // yields the running sidecar total as candidate, which every sidecar
    // step has already folded into the peak.
    for (resource, peak) in init_peak {
        raise(&mut app_sum, resource, peak);
    }

    Ok(app_sum.into_iter().collect())
}

fn parse_requests(container: &ContainerSpec) -> Result<Vec<(String, Quantity)>, ReduceError> {
    container
        .requests
        .iter()
        .map(|(resource, raw)| {
            Quantity::parse(raw)
                .map(|q| (resource.clone(), q))
                .map_err(|source| ReduceError::MalformedQuantity {
                    container: container.name.clone(),
                    resource: resource.clone(),
                    source,
                })
        })
        .collect()
}

fn add(
    container: &ContainerSpec,
    resource: &str,
    a: Quantity,
    b: Quantity,
) -> Result<Quantity, ReduceError> {
    a.checked_add(b).ok_or_else(|| ReduceError::MalformedQuantity {
        container: container.name.clone(),
        resource: resource.to_string(),
        source: QuantityError::OutOfRange(b.to_string()),
    })
}

fn raise(map: &mut BTreeMap<String, Quantity>, resource: String, candidate: Quantity) {
    let current = map.entry(resource).or_insert(candidate);
    if candidate > *current {
        *current = candidate;
    }
}
