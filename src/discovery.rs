//! Service-discovery interface and a static in-process implementation.
//!
//! The discovery feed is a collaborator seam: an implementation announces
//! `(domain, service)` instance sets and fires a change callback with the
//! old and new maps whenever a set changes. The ZooKeeper-backed
//! implementation lives outside this crate; [`StaticDiscovery`] serves
//! configuration-driven deployments and tests.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One advertised service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Stable identity derived from the address.
    pub id: u64,
    /// Host address.
    pub ip: String,
    /// TCP port.
    pub port: u16,
    /// Opaque per-instance payload (weights, zones, ...).
    pub data: String,
}

impl ServiceInstance {
    /// Parses `ip:port`; the id packs an IPv4 address and port, falling
    /// back to a string hash for anything else.
    #[must_use]
    pub fn new(addr: &str, data: impl Into<String>) -> Option<Arc<Self>> {
        let (ip, port) = addr.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let id = match ip.parse::<Ipv4Addr>() {
            Ok(v4) => (u64::from(u32::from_ne_bytes(v4.octets()).to_be()) << 32) | u64::from(port),
            Err(_) => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                addr.hash(&mut hasher);
                hasher.finish()
            }
        };
        Some(Arc::new(Self {
            id,
            ip: ip.to_string(),
            port,
            data: data.into(),
        }))
    }

    /// `ip:port` form.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Instance set keyed by instance id.
pub type InstanceMap = HashMap<u64, Arc<ServiceInstance>>;

/// Change callback: `(domain, service, old_set, new_set)`.
pub type ChangeCallback =
    Arc<dyn Fn(&str, &str, &InstanceMap, &InstanceMap) + Send + Sync + 'static>;

/// The discovery feed consumed by the load balancer.
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// Starts watching (and announcing registered endpoints).
    fn start(&self);

    /// Stops watching.
    fn stop(&self);

    /// Announces a local endpoint under `(domain, service)`.
    fn register(&self, domain: &str, service: &str, addr: &str, data: &str);

    /// Declares interest in `(domain, service)`.
    fn query(&self, domain: &str, service: &str);

    /// Snapshot of the current instance set.
    fn instances(&self, domain: &str, service: &str) -> InstanceMap;

    /// Installs the change callback.
    fn set_callback(&self, callback: ChangeCallback);
}

#[derive(Default)]
struct StaticState {
    // domain -> service -> instances
    data: HashMap<String, HashMap<String, InstanceMap>>,
    queries: HashMap<String, HashSet<String>>,
}

/// In-process discovery: instance sets are mutated directly and change
/// callbacks fire synchronously.
#[derive(Default)]
pub struct StaticDiscovery {
    state: RwLock<StaticState>,
    callback: RwLock<Option<ChangeCallback>>,
    started: AtomicBool,
}

impl std::fmt::Debug for StaticDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticDiscovery")
            .field("domains", &self.state.read().data.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl StaticDiscovery {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the instance set for `(domain, service)`, firing the
    /// change callback with the old and new maps.
    pub fn set_instances(
        &self,
        domain: &str,
        service: &str,
        instances: Vec<Arc<ServiceInstance>>,
    ) {
        let new_map: InstanceMap = instances
            .into_iter()
            .map(|instance| (instance.id, instance))
            .collect();
        let new_len = new_map.len();
        let old_map = {
            let mut state = self.state.write();
            state
                .data
                .entry(domain.to_string())
                .or_default()
                .insert(service.to_string(), new_map)
                .unwrap_or_default()
        };
        debug!(domain, service, old = old_map.len(), new = new_len, "instance set changed");
        if self.started.load(Ordering::Acquire) {
            if let Some(callback) = self.callback.read().clone() {
                // Snapshot only when a subscriber wants the new set.
                let new_map = self.instances(domain, service);
                callback(domain, service, &old_map, &new_map);
            }
        }
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("static discovery started");
        // Replay current state so a late subscriber sees every set.
        let snapshot: Vec<(String, String, InstanceMap)> = {
            let state = self.state.read();
            state
                .data
                .iter()
                .flat_map(|(domain, services)| {
                    services.iter().map(move |(service, instances)| {
                        (domain.clone(), service.clone(), instances.clone())
                    })
                })
                .collect()
        };
        if let Some(callback) = self.callback.read().clone() {
            let empty = InstanceMap::new();
            for (domain, service, instances) in snapshot {
                callback(&domain, &service, &empty, &instances);
            }
        }
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    fn register(&self, domain: &str, service: &str, addr: &str, data: &str) {
        let Some(instance) = ServiceInstance::new(addr, data) else {
            return;
        };
        let mut current: Vec<Arc<ServiceInstance>> = self
            .instances(domain, service)
            .into_values()
            .collect();
        current.retain(|existing| existing.id != instance.id);
        current.push(instance);
        self.set_instances(domain, service, current);
    }

    fn query(&self, domain: &str, service: &str) {
        self.state
            .write()
            .queries
            .entry(domain.to_string())
            .or_default()
            .insert(service.to_string());
    }

    fn instances(&self, domain: &str, service: &str) -> InstanceMap {
        self.state
            .read()
            .data
            .get(domain)
            .and_then(|services| services.get(service))
            .cloned()
            .unwrap_or_default()
    }

    fn set_callback(&self, callback: ChangeCallback) {
        *self.callback.write() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn instance_id_packs_v4_addr_and_port() {
        let a = ServiceInstance::new("10.0.0.1:8000", "").expect("parse");
        let b = ServiceInstance::new("10.0.0.1:8001", "").expect("parse");
        let c = ServiceInstance::new("10.0.0.2:8000", "").expect("parse");
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.addr(), "10.0.0.1:8000");
    }

    #[test]
    fn malformed_addr_is_rejected() {
        assert!(ServiceInstance::new("no-port", "").is_none());
        assert!(ServiceInstance::new("host:notaport", "").is_none());
    }

    #[test]
    fn change_callback_sees_old_and_new() {
        let sd = StaticDiscovery::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sd.set_callback(Arc::new(move |domain, service, old, new| {
            sink.lock()
                .push((domain.to_string(), service.to_string(), old.len(), new.len()));
        }));
        sd.start();

        let one = ServiceInstance::new("127.0.0.1:9000", "").expect("parse");
        let two = ServiceInstance::new("127.0.0.1:9001", "").expect("parse");
        sd.set_instances("edge", "rock", vec![Arc::clone(&one), Arc::clone(&two)]);
        sd.set_instances("edge", "rock", vec![one]);

        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ("edge".into(), "rock".into(), 0, 2));
        assert_eq!(events[1], ("edge".into(), "rock".into(), 2, 1));
    }

    #[test]
    fn start_replays_existing_sets() {
        let sd = StaticDiscovery::new();
        let one = ServiceInstance::new("127.0.0.1:9000", "").expect("parse");
        sd.set_instances("edge", "rock", vec![one]);

        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        sd.set_callback(Arc::new(move |_, _, old, new| {
            assert_eq!(old.len(), 0);
            assert_eq!(new.len(), 1);
            *sink.lock() += 1;
        }));
        sd.start();
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn register_accumulates_instances() {
        let sd = StaticDiscovery::new();
        sd.register("edge", "rock", "127.0.0.1:9000", "");
        sd.register("edge", "rock", "127.0.0.1:9001", "");
        sd.register("edge", "rock", "127.0.0.1:9000", "replaced");
        let set = sd.instances("edge", "rock");
        assert_eq!(set.len(), 2);
    }
}
