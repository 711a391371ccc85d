//! Access-router liveness tracking, per `spec.md` §4.8 and §3.
//!
//! Grounded on `examples/original_source/bng/lib/services/router_tracker.py`'s
//! `RouterTracker`: an in-memory `{router_name: {giaddr, last_seen,
//! is_alive, next_ping}}` table, updated opportunistically from observed
//! DHCP traffic and swept by a ping tick, dispatching `ROUTER_UPDATE` on
//! liveness transitions. `spec.md` §3/§4.8 deliberately diverges from the
//! original's auto-discovery (splitting `circuit_id` on `"|"` to invent a
//! router name): routers are instead drawn from an externally supplied
//! inventory and matched by `remote_id`, so a router's identity does not
//! depend on an access-switch's Circuit-ID convention (`DESIGN.md`).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::warn;
use serde::Deserialize;
use tokio::process::Command;

use crate::model::AccessRouterEntry;

/// One entry of the externally maintained router inventory, refreshed
/// out-of-band per `spec.md` §1's "out of scope" note on provisioning.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterInventoryEntry {
    pub router_name: String,
    pub bng_id: String,
    pub remote_id: String,
}

pub async fn load_inventory(path: &str) -> std::io::Result<Vec<RouterInventoryEntry>> {
    let raw = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// A liveness transition worth dispatching as `ROUTER_UPDATE`.
pub struct RouterUpdate {
    pub router_name: String,
    pub giaddr: Ipv4Addr,
    pub is_alive: bool,
    pub last_seen: Instant,
}

pub struct RouterTracker {
    bng_id: String,
    inventory: Vec<RouterInventoryEntry>,
    ping_interval: Duration,
}

impl RouterTracker {
    pub fn new(bng_id: String, inventory: Vec<RouterInventoryEntry>, ping_interval: Duration) -> Self {
        Self {
            bng_id,
            inventory,
            ping_interval,
        }
    }

    fn router_name_for(&self, remote_id: &str) -> Option<&str> {
        self.inventory
            .iter()
            .find(|e| e.bng_id == self.bng_id && e.remote_id == remote_id)
            .map(|e| e.router_name.as_str())
    }

    /// Called for every DHCP event carrying a `remote_id` and a non-zero
    /// `giaddr`. Creates or refreshes the router's table entry and returns
    /// a liveness transition to dispatch, if any.
    pub fn on_dhcp_event(
        &self,
        routers: &mut HashMap<String, AccessRouterEntry>,
        remote_id: &str,
        giaddr: Ipv4Addr,
        now: Instant,
    ) -> Option<RouterUpdate> {
        if giaddr == Ipv4Addr::UNSPECIFIED {
            return None;
        }
        let name = self.router_name_for(remote_id)?.to_string();

        match routers.get_mut(&name) {
            None => {
                routers.insert(
                    name.clone(),
                    AccessRouterEntry {
                        giaddr,
                        is_alive: true,
                        last_seen: now,
                        next_ping: now + self.ping_interval,
                    },
                );
                Some(RouterUpdate {
                    router_name: name,
                    giaddr,
                    is_alive: true,
                    last_seen: now,
                })
            }
            Some(entry) => {
                entry.last_seen = now;
                entry.giaddr = giaddr;
                entry.next_ping = now + self.ping_interval;
                // Traffic seen from a router means it is alive; any stale
                // "down" mark is cleared immediately rather than waiting
                // for the next ping sweep.
                if !entry.is_alive {
                    entry.is_alive = true;
                    Some(RouterUpdate {
                        router_name: name,
                        giaddr,
                        is_alive: true,
                        last_seen: now,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Pings every entry overdue for a check and returns the transitions
    /// worth dispatching, per `spec.md` §4.8's ping tick.
    pub async fn check_routers(&self, routers: &mut HashMap<String, AccessRouterEntry>, now: Instant) -> Vec<RouterUpdate> {
        let overdue: Vec<(String, Ipv4Addr)> = routers
            .iter()
            .filter(|(_, entry)| now >= entry.next_ping)
            .map(|(name, entry)| (name.clone(), entry.giaddr))
            .collect();

        let mut updates = Vec::new();
        for (name, giaddr) in overdue {
            let alive = ping(giaddr).await;
            if let Some(entry) = routers.get_mut(&name) {
                entry.is_alive = alive;
                entry.last_seen = now;
                entry.next_ping = now + self.ping_interval;
                updates.push(RouterUpdate {
                    router_name: name,
                    giaddr,
                    is_alive: alive,
                    last_seen: now,
                });
            }
        }
        updates
    }
}

async fn ping(ip: Ipv4Addr) -> bool {
    match Command::new("ping").args(["-c", "1", "-W", "1", &ip.to_string()]).status().await {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("router_tracker: failed to spawn ping for {ip}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RouterTracker {
        RouterTracker::new(
            "bng-1".into(),
            vec![RouterInventoryEntry {
                router_name: "access-1".into(),
                bng_id: "bng-1".into(),
                remote_id: "R1".into(),
            }],
            Duration::from_secs(20),
        )
    }

    #[test]
    fn unmatched_remote_id_is_ignored() {
        let t = tracker();
        let mut routers = HashMap::new();
        let now = Instant::now();
        let result = t.on_dhcp_event(&mut routers, "R-unknown", Ipv4Addr::new(10, 0, 0, 1), now);
        assert!(result.is_none());
        assert!(routers.is_empty());
    }

    #[test]
    fn first_sighting_creates_entry_and_dispatches() {
        let t = tracker();
        let mut routers = HashMap::new();
        let now = Instant::now();
        let update = t.on_dhcp_event(&mut routers, "R1", Ipv4Addr::new(10, 0, 0, 1), now).unwrap();
        assert_eq!(update.router_name, "access-1");
        assert!(update.is_alive);
        assert!(routers.contains_key("access-1"));
    }

    #[test]
    fn zero_giaddr_is_ignored() {
        let t = tracker();
        let mut routers = HashMap::new();
        let result = t.on_dhcp_event(&mut routers, "R1", Ipv4Addr::UNSPECIFIED, Instant::now());
        assert!(result.is_none());
    }

    #[test]
    fn repeated_sighting_while_alive_does_not_redispatch() {
        let t = tracker();
        let mut routers = HashMap::new();
        let now = Instant::now();
        t.on_dhcp_event(&mut routers, "R1", Ipv4Addr::new(10, 0, 0, 1), now);
        let second = t.on_dhcp_event(&mut routers, "R1", Ipv4Addr::new(10, 0, 0, 1), now);
        assert!(second.is_none());
    }
}
