/*!
 * Resolved GATT capability set of a connected peripheral.
 */
use serde::{Deserialize, Serialize};

use bluelink_core::types::GattUuid;

/// How one service came out of the GATT handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceResolution {
    /// The service and every required characteristic were found
    Resolved(Vec<GattUuid>),
    /// The peripheral does not expose the service
    Missing,
    /// The service exists but its characteristics could not be resolved
    Failed(String),
}

impl ServiceResolution {
    /// Whether the service is usable
    pub fn is_resolved(&self) -> bool {
        matches!(self, ServiceResolution::Resolved(_))
    }

    /// Human-readable failure, if any
    pub fn failure(&self) -> Option<String> {
        match self {
            ServiceResolution::Resolved(_) => None,
            ServiceResolution::Missing => Some("service not found".to_string()),
            ServiceResolution::Failed(reason) => Some(reason.clone()),
        }
    }
}

/// A service entry in a [`ResolvedProfile`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedService {
    /// Service UUID
    pub uuid: GattUuid,
    /// Outcome for this service
    pub resolution: ServiceResolution,
}

/// Services resolved during a connection attempt, in the order their outcomes became known
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    services: Vec<ResolvedService>,
}

impl ResolvedProfile {
    /// Create an empty profile
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for a service, replacing any earlier one
    pub fn record(&mut self, uuid: GattUuid, resolution: ServiceResolution) {
        match self.services.iter_mut().find(|s| s.uuid == uuid) {
            Some(existing) => existing.resolution = resolution,
            None => self.services.push(ResolvedService { uuid, resolution }),
        }
    }

    /// All recorded services
    pub fn services(&self) -> &[ResolvedService] {
        &self.services
    }

    /// Look up the outcome for a service
    pub fn service(&self, uuid: &GattUuid) -> Option<&ServiceResolution> {
        self.services
            .iter()
            .find(|s| &s.uuid == uuid)
            .map(|s| &s.resolution)
    }

    /// Characteristics of a resolved service
    pub fn characteristics(&self, uuid: &GattUuid) -> Option<&[GattUuid]> {
        match self.service(uuid) {
            Some(ServiceResolution::Resolved(characteristics)) => Some(characteristics),
            _ => None,
        }
    }

    /// Whether every recorded service resolved
    pub fn is_complete(&self) -> bool {
        self.services.iter().all(|s| s.resolution.is_resolved())
    }

    /// The first service that did not resolve, with its failure
    pub fn first_failure(&self) -> Option<(GattUuid, String)> {
        self.services
            .iter()
            .find_map(|s| s.resolution.failure().map(|reason| (s.uuid, reason)))
    }
}
