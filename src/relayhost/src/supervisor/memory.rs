//! In-memory supervisor: models instances, port ownership and restart
//! policy without touching the host. A test double; a poisoned lock panics.
use super::{PreparedImage, ServiceSupervisor, SupervisorError, UnitStatus};
use crate::service::{RestartPolicy, ServiceUnit};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// What happened to the simulated host, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    ConflictStopped { service: String, port: u16 },
    Pulled { image: String },
    Started { name: String, instance: u64 },
    Stopped { name: String, instance: u64, forced: bool },
    Restarted { name: String, instance: u64 },
    Removed { name: String },
}

#[derive(Debug, Clone)]
struct Instance {
    id: u64,
    unit: ServiceUnit,
    restarts: u32,
}

/// Owner of a bound port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOwner {
    Service(String),
    Instance { name: String, instance: u64 },
}

#[derive(Debug, Default)]
struct State {
    instances: BTreeMap<String, Instance>,
    registered: BTreeMap<String, ServiceUnit>,
    ports: HashMap<u16, PortOwner>,
    events: Vec<SupervisorEvent>,
    next_id: u64,
    fail_pull: Option<String>,
    fail_start: Option<String>,
    ignore_graceful_stop: bool,
}

#[derive(Debug, Default)]
pub struct MemorySupervisor {
    state: Mutex<State>,
}

impl MemorySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generic web server already holding `port`.
    pub fn with_conflicting_service(self, service: &str, port: u16) -> Self {
        self.state
            .lock()
            .unwrap()
            .ports
            .insert(port, PortOwner::Service(service.to_string()));
        self
    }

    /// Make `prepare` fail with `cause`.
    pub fn fail_pull(&self, cause: &str) {
        self.state.lock().unwrap().fail_pull = Some(cause.to_string());
    }

    /// Make `start` fail with `cause`.
    pub fn fail_start(&self, cause: &str) {
        self.state.lock().unwrap().fail_start = Some(cause.to_string());
    }

    /// Instances ignore graceful stop and must be force-removed.
    pub fn ignore_graceful_stop(&self) {
        self.state.lock().unwrap().ignore_graceful_stop = true;
    }

    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Running instances as (name, instance id).
    pub fn instances(&self) -> Vec<(String, u64)> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .map(|i| (i.unit.name.clone(), i.id))
            .collect()
    }

    pub fn registered_units(&self) -> Vec<ServiceUnit> {
        self.state
            .lock()
            .unwrap()
            .registered
            .values()
            .cloned()
            .collect()
    }

    pub fn port_owner(&self, port: u16) -> Option<PortOwner> {
        self.state.lock().unwrap().ports.get(&port).cloned()
    }

    pub fn restart_count(&self, name: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(name)
            .map(|i| i.restarts)
    }

    /// The relay process exits unexpectedly. Under an always-restart
    /// policy it comes back; otherwise the instance is gone.
    pub fn simulate_crash(&self, name: &str) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(instance) = state.instances.get_mut(name) else {
            return;
        };
        match instance.unit.restart {
            RestartPolicy::Always { .. } => {
                instance.restarts += 1;
                let event = SupervisorEvent::Restarted {
                    name: name.to_string(),
                    instance: instance.id,
                };
                state.events.push(event);
            }
            RestartPolicy::Never => {
                if let Some(instance) = state.instances.remove(name) {
                    state.ports.remove(&instance.unit.listen_port);
                }
            }
        }
    }

    fn stop_locked(state: &mut State, name: &str) {
        if let Some(instance) = state.instances.remove(name) {
            state.ports.remove(&instance.unit.listen_port);
            let forced = state.ignore_graceful_stop;
            state.events.push(SupervisorEvent::Stopped {
                name: name.to_string(),
                instance: instance.id,
                forced,
            });
        }
    }
}

#[async_trait]
impl ServiceSupervisor for MemorySupervisor {
    async fn stop_conflicting(&self, port: u16) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        match state.ports.get(&port).cloned() {
            Some(PortOwner::Service(service)) => {
                state.ports.remove(&port);
                state.events.push(SupervisorEvent::ConflictStopped {
                    service: service.clone(),
                    port,
                });
                vec![service]
            }
            _ => Vec::new(),
        }
    }

    async fn prepare(&self, image_ref: &str) -> Result<PreparedImage, SupervisorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(cause) = &state.fail_pull {
            return Err(SupervisorError::Pull {
                image: image_ref.to_string(),
                cause: cause.clone(),
            });
        }
        state.events.push(SupervisorEvent::Pulled {
            image: image_ref.to_string(),
        });
        Ok(PreparedImage {
            reference: image_ref.to_string(),
            id: Some(format!("sha256:memory-{}", image_ref.len())),
        })
    }

    async fn start(&self, unit: &ServiceUnit) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(cause) = &state.fail_start {
            return Err(SupervisorError::Start {
                name: unit.name.clone(),
                cause: cause.clone(),
            });
        }

        Self::stop_locked(&mut state, &unit.name);

        if let Some(owner) = state.ports.get(&unit.listen_port) {
            return Err(SupervisorError::Start {
                name: unit.name.clone(),
                cause: format!("port {} already in use by {:?}", unit.listen_port, owner),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.ports.insert(
            unit.listen_port,
            PortOwner::Instance {
                name: unit.name.clone(),
                instance: id,
            },
        );
        state.instances.insert(
            unit.name.clone(),
            Instance {
                id,
                unit: unit.clone(),
                restarts: 0,
            },
        );
        state.registered.insert(unit.name.clone(), unit.clone());
        state.events.push(SupervisorEvent::Started {
            name: unit.name.clone(),
            instance: id,
        });
        Ok(())
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        Self::stop_locked(&mut state, name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        Self::stop_locked(&mut state, name);
        if state.registered.remove(name).is_some() {
            state.events.push(SupervisorEvent::Removed {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, SupervisorError> {
        let state = self.state.lock().unwrap();
        Ok(if state.instances.contains_key(name) {
            UnitStatus::Running
        } else if state.registered.contains_key(name) {
            UnitStatus::Stopped
        } else {
            UnitStatus::NotFound
        })
    }
}
