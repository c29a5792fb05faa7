// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::build_default_adapters;
use crate::manager::Adapters;
use anyhow::{Result, anyhow};
use storage_contracts::{
    DiskProbeAdapter, KeyOpsAdapter, MountOpsAdapter, OwnershipOpsAdapter, ProcessOpsAdapter,
};
use storage_sys::SysfsProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concern {
    Mounts,
    Keys,
    Probe,
    Processes,
    Ownership,
}

const REQUIRED_CONCERNS: [Concern; 5] = [
    Concern::Mounts,
    Concern::Keys,
    Concern::Probe,
    Concern::Processes,
    Concern::Ownership,
];

pub struct AdapterRegistry {
    routes: HashMap<Concern, &'static str>,
    mounts: Arc<dyn MountOpsAdapter>,
    keys: Arc<dyn KeyOpsAdapter>,
    probe: Arc<dyn DiskProbeAdapter>,
    processes: Arc<dyn ProcessOpsAdapter>,
    ownership: Arc<dyn OwnershipOpsAdapter>,
}

impl AdapterRegistry {
    pub fn build_default() -> Result<Self> {
        let adapters = build_default_adapters(SysfsProbe::default());

        let mut routes = HashMap::new();
        routes.insert(Concern::Mounts, "sys");
        routes.insert(Concern::Keys, "fscryptctl");
        routes.insert(Concern::Probe, "sysfs");
        routes.insert(Concern::Processes, "procfs");
        routes.insert(Concern::Ownership, "sys");

        Self::from_parts(routes, adapters)
    }

    fn from_parts(routes: HashMap<Concern, &'static str>, adapters: Adapters) -> Result<Self> {
        for concern in REQUIRED_CONCERNS {
            if !routes.contains_key(&concern) {
                return Err(anyhow!(
                    "Missing required adapter routing for concern: {:?}",
                    concern
                ));
            }
        }

        Ok(Self {
            routes,
            mounts: adapters.mounts,
            keys: adapters.keys,
            probe: adapters.probe,
            processes: adapters.processes,
            ownership: adapters.ownership,
        })
    }

    pub fn mounts(&self) -> Arc<dyn MountOpsAdapter> {
        self.mounts.clone()
    }

    pub fn keys(&self) -> Arc<dyn KeyOpsAdapter> {
        self.keys.clone()
    }

    pub fn probe(&self) -> Arc<dyn DiskProbeAdapter> {
        self.probe.clone()
    }

    pub fn processes(&self) -> Arc<dyn ProcessOpsAdapter> {
        self.processes.clone()
    }

    pub fn ownership(&self) -> Arc<dyn OwnershipOpsAdapter> {
        self.ownership.clone()
    }

    /// The collaborator set handed to the orchestrator
    pub fn adapters(&self) -> Adapters {
        Adapters {
            mounts: self.mounts(),
            keys: self.keys(),
            probe: self.probe(),
            processes: self.processes(),
            ownership: self.ownership(),
        }
    }

    pub fn route_for(&self, concern: Concern) -> Option<&'static str> {
        self.routes.get(&concern).copied()
    }
}
