//! Named networks, IP allocation, and per-job veth plumbing.
//!
//! A named network is a host bridge plus a CIDR. Jobs on `bridge` (the
//! default shared network) or on a custom network get the lowest free
//! host address; the network address, the broadcast address and the
//! gateway (`.1`) are never handed out. The veth pair is created by the
//! parent after the child exists, configured through `ip(8)` (and
//! `nsenter(8)` for the in-namespace side), and the child is unblocked by
//! one byte on its ready pipe once the interface is up.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::JobletConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;

/// The implicit shared network every `bridge` job lands on.
pub const DEFAULT_NETWORK: &str = "bridge";

/// Deterministic veth names for a child PID. PIDs are unique in the
/// kernel at any instant, so truncating to four digits cannot collide
/// among live jobs.
pub fn veth_names(pid: u32) -> (String, String) {
    let n = pid % 10_000;
    (format!("vjob{n}"), format!("vjob{n}p"))
}

#[derive(Debug, Clone)]
struct NamedNetwork {
    cidr: Ipv4Net,
    bridge_name: String,
    allocated: BTreeSet<Ipv4Addr>,
    /// The default network exists from startup and cannot be removed.
    builtin: bool,
}

impl NamedNetwork {
    fn gateway(&self) -> Ipv4Addr {
        // First usable host.
        let base = u32::from(self.cidr.network());
        Ipv4Addr::from(base + 1)
    }
}

/// Client-facing network description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub cidr: String,
    pub bridge: String,
    pub allocated: usize,
}

/// The record tying a running job to its address. Owned by the job; the
/// manager only indexes it for cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobNetworkAllocation {
    pub job_uuid: String,
    pub network_name: String,
    pub ip_address: Ipv4Addr,
    pub hostname: String,
    pub veth_host: String,
    pub veth_peer: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    networks: BTreeMap<String, NamedNetwork>,
    allocations: HashMap<String, JobNetworkAllocation>,
}

pub struct NetworkManager {
    platform: Arc<dyn Platform>,
    state: Mutex<State>,
}

impl NetworkManager {
    pub fn new(platform: Arc<dyn Platform>, config: &JobletConfig) -> Result<NetworkManager> {
        let cidr: Ipv4Net = config.bridge.cidr.parse().map_err(|_| {
            Error::validation_field("bridge.cidr", format!("bad CIDR {:?}", config.bridge.cidr))
        })?;
        let mut state = State::default();
        state.networks.insert(
            DEFAULT_NETWORK.to_string(),
            NamedNetwork {
                cidr,
                bridge_name: config.bridge.name.clone(),
                allocated: BTreeSet::new(),
                builtin: true,
            },
        );
        Ok(NetworkManager {
            platform,
            state: Mutex::new(state),
        })
    }

    /// Declare a network. The bridge device is created host-side right
    /// away so the first job does not pay for it.
    pub fn create_network(&self, name: &str, cidr: &str) -> Result<NetworkInfo> {
        if name.is_empty()
            || matches!(name, "isolated" | "none")
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            return Err(Error::validation_field(
                "network",
                format!("bad network name {name:?}"),
            ));
        }
        let parsed: Ipv4Net = cidr
            .parse()
            .map_err(|_| Error::validation_field("cidr", format!("bad CIDR {cidr:?}")))?;

        let mut state = self.state.lock().expect("network state");
        if state.networks.contains_key(name) {
            return Err(Error::InvalidState(format!("network {name:?} already exists")));
        }
        let bridge_name = format!("jb-{name}");
        let net = NamedNetwork {
            cidr: parsed,
            bridge_name: bridge_name.clone(),
            allocated: BTreeSet::new(),
            builtin: false,
        };
        self.ensure_bridge(&net)
            .map_err(|e| Error::ResourceSetup(format!("bridge for {name:?}: {e:#}")))?;
        state.networks.insert(name.to_string(), net);
        info!(network = name, cidr, bridge = %bridge_name, "network created");
        Ok(NetworkInfo {
            name: name.to_string(),
            cidr: parsed.to_string(),
            bridge: bridge_name,
            allocated: 0,
        })
    }

    /// Destroy a network. Refused while any job still holds an address
    /// on it; networks are never reclaimed implicitly.
    pub fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().expect("network state");
        let net = state
            .networks
            .get(name)
            .ok_or_else(|| Error::not_found("network", name))?;
        if net.builtin {
            return Err(Error::InvalidState(format!(
                "network {name:?} is built in and cannot be removed"
            )));
        }
        if state.allocations.values().any(|a| a.network_name == name) {
            return Err(Error::InvalidState(format!(
                "network {name:?} still has jobs attached"
            )));
        }
        let bridge = net.bridge_name.clone();
        let _ = self.platform.run_command("ip", &["link", "del", &bridge]);
        state.networks.remove(name);
        info!(network = name, "network removed");
        Ok(())
    }

    pub fn list_networks(&self) -> Vec<NetworkInfo> {
        let state = self.state.lock().expect("network state");
        state
            .networks
            .iter()
            .map(|(name, net)| NetworkInfo {
                name: name.clone(),
                cidr: net.cidr.to_string(),
                bridge: net.bridge_name.clone(),
                allocated: net.allocated.len(),
            })
            .collect()
    }

    /// Lowest free host address, excluding network, broadcast and the
    /// gateway. Exhaustion leaves the allocation set unchanged.
    pub fn allocate_ip(&self, network: &str) -> Result<Ipv4Addr> {
        let mut state = self.state.lock().expect("network state");
        let net = state
            .networks
            .get_mut(network)
            .ok_or_else(|| Error::not_found("network", network))?;
        let gateway = net.gateway();
        let candidate = net
            .cidr
            .hosts()
            .find(|ip| *ip != gateway && !net.allocated.contains(ip));
        match candidate {
            Some(ip) => {
                net.allocated.insert(ip);
                debug!(network, ip = %ip, "ip allocated");
                Ok(ip)
            }
            None => Err(Error::ResourceSetup(format!(
                "network {network:?} has no free addresses"
            ))),
        }
    }

    /// Idempotent; unknown networks and unallocated addresses are no-ops.
    pub fn release_ip(&self, network: &str, ip: Ipv4Addr) {
        let mut state = self.state.lock().expect("network state");
        if let Some(net) = state.networks.get_mut(network) {
            net.allocated.remove(&ip);
        }
    }

    pub fn gateway(&self, network: &str) -> Result<Ipv4Addr> {
        let state = self.state.lock().expect("network state");
        state
            .networks
            .get(network)
            .map(NamedNetwork::gateway)
            .ok_or_else(|| Error::not_found("network", network))
    }

    /// Build the allocation record for a freshly allocated address.
    pub fn make_allocation(
        &self,
        job_uuid: &str,
        network: &str,
        ip: Ipv4Addr,
        child_pid: u32,
        now: DateTime<Utc>,
    ) -> JobNetworkAllocation {
        let (veth_host, veth_peer) = veth_names(child_pid);
        JobNetworkAllocation {
            job_uuid: job_uuid.to_string(),
            network_name: network.to_string(),
            ip_address: ip,
            hostname: format!("job-{}", &job_uuid[..job_uuid.len().min(8)]),
            veth_host,
            veth_peer,
            assigned_at: now,
        }
    }

    /// Record the allocation; a failure releases the address so nothing
    /// leaks.
    pub fn assign_job(&self, alloc: JobNetworkAllocation) -> Result<()> {
        let mut state = self.state.lock().expect("network state");
        if state.allocations.contains_key(&alloc.job_uuid) {
            let (network, ip) = (alloc.network_name.clone(), alloc.ip_address);
            if let Some(net) = state.networks.get_mut(&network) {
                net.allocated.remove(&ip);
            }
            return Err(Error::ResourceSetup(format!(
                "job {} already has a network allocation",
                alloc.job_uuid
            )));
        }
        state.allocations.insert(alloc.job_uuid.clone(), alloc);
        Ok(())
    }

    pub fn allocation_for(&self, job_uuid: &str) -> Option<JobNetworkAllocation> {
        self.state
            .lock()
            .expect("network state")
            .allocations
            .get(job_uuid)
            .cloned()
    }

    pub fn remove_allocation(&self, job_uuid: &str) -> Option<JobNetworkAllocation> {
        self.state
            .lock()
            .expect("network state")
            .allocations
            .remove(job_uuid)
    }

    /// Every live allocation; the reconciler sweeps these against the
    /// job table.
    pub fn allocations(&self) -> Vec<JobNetworkAllocation> {
        self.state
            .lock()
            .expect("network state")
            .allocations
            .values()
            .cloned()
            .collect()
    }

    /// Parent-side interface construction, run after the child process
    /// exists: veth pair, peer into the child's netns, addresses, default
    /// route, bridge attachment.
    pub fn setup_job_network(
        &self,
        alloc: &JobNetworkAllocation,
        child_pid: u32,
    ) -> anyhow::Result<()> {
        let (bridge, prefix, gateway) = {
            let state = self.state.lock().expect("network state");
            let net = state
                .networks
                .get(&alloc.network_name)
                .with_context(|| format!("network {:?} is gone", alloc.network_name))?;
            (net.bridge_name.clone(), net.cidr.prefix_len(), net.gateway())
        };
        let pid = child_pid.to_string();
        let addr = format!("{}/{}", alloc.ip_address, prefix);
        let gw = gateway.to_string();

        self.ip(&[
            "link", "add", &alloc.veth_host, "type", "veth", "peer", "name", &alloc.veth_peer,
        ])?;
        self.ip(&["link", "set", &alloc.veth_peer, "netns", &pid])?;
        self.ip(&["link", "set", &alloc.veth_host, "master", &bridge])?;
        self.ip(&["link", "set", &alloc.veth_host, "up"])?;
        self.in_netns(&pid, &["ip", "link", "set", "lo", "up"])?;
        self.in_netns(&pid, &["ip", "addr", "add", &addr, "dev", &alloc.veth_peer])?;
        self.in_netns(&pid, &["ip", "link", "set", &alloc.veth_peer, "up"])?;
        self.in_netns(&pid, &["ip", "route", "add", "default", "via", &gw])?;
        info!(
            job_id = %alloc.job_uuid,
            ip = %alloc.ip_address,
            veth = %alloc.veth_host,
            "job network up"
        );
        Ok(())
    }

    /// Remove the host-side veth; the peer disappears with it (or with
    /// the namespace). Best-effort.
    pub fn teardown_job_network(&self, alloc: &JobNetworkAllocation) {
        match self.platform.run_command("ip", &["link", "del", &alloc.veth_host]) {
            Ok(out) if !out.success() => {
                debug!(veth = %alloc.veth_host, "veth already gone");
            }
            Err(e) => warn!(veth = %alloc.veth_host, error = %e, "veth teardown skipped"),
            Ok(_) => {}
        }
        self.release_ip(&alloc.network_name, alloc.ip_address);
    }

    fn ensure_bridge(&self, net: &NamedNetwork) -> anyhow::Result<()> {
        let exists = self
            .platform
            .run_command("ip", &["link", "show", &net.bridge_name])
            .map(|out| out.success())
            .unwrap_or(false);
        if exists {
            return Ok(());
        }
        self.ip(&["link", "add", &net.bridge_name, "type", "bridge"])?;
        let gw = format!("{}/{}", net.gateway(), net.cidr.prefix_len());
        self.ip(&["addr", "add", &gw, "dev", &net.bridge_name])?;
        self.ip(&["link", "set", &net.bridge_name, "up"])?;
        Ok(())
    }

    /// Bring up the shared bridge device; called once at daemon startup.
    pub fn ensure_default_bridge(&self) -> anyhow::Result<()> {
        let net = {
            let state = self.state.lock().expect("network state");
            state
                .networks
                .get(DEFAULT_NETWORK)
                .cloned()
                .expect("default network exists")
        };
        self.ensure_bridge(&net)
    }

    fn ip(&self, args: &[&str]) -> anyhow::Result<()> {
        let out = self.platform.run_command("ip", args)?;
        if !out.success() {
            bail!("ip {}: {}", args.join(" "), out.stderr_text().trim());
        }
        Ok(())
    }

    fn in_netns(&self, pid: &str, command: &[&str]) -> anyhow::Result<()> {
        let mut args = vec!["--target", pid, "--net", "--"];
        args.extend_from_slice(command);
        let out = self.platform.run_command("nsenter", &args)?;
        if !out.success() {
            bail!(
                "nsenter -t {pid} -n {}: {}",
                command.join(" "),
                out.stderr_text().trim()
            );
        }
        Ok(())
    }

    /// Namespace file reference a job may have pinned under the run dir.
    /// Nothing is created there today, so removal usually no-ops; cleanup
    /// still sweeps it to tolerate older daemons.
    pub fn netns_ref_path(run_dir: &std::path::Path, job_uuid: &str) -> PathBuf {
        run_dir.join("netns").join(job_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;

    fn manager() -> (Arc<FakePlatform>, NetworkManager) {
        let platform = Arc::new(FakePlatform::new());
        let mgr = NetworkManager::new(platform.clone(), &JobletConfig::default()).expect("new");
        (platform, mgr)
    }

    fn small_net(mgr: &NetworkManager) {
        // /30: network, two hosts (one is the gateway), broadcast.
        mgr.create_network("tiny", "10.9.0.0/30").expect("create");
    }

    #[test]
    fn default_bridge_is_present() {
        let (_, mgr) = manager();
        let nets = mgr.list_networks();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].name, "bridge");
        assert_eq!(nets[0].bridge, "joblet0");
    }

    #[test]
    fn allocate_skips_network_gateway_broadcast() {
        let (_, mgr) = manager();
        small_net(&mgr);
        // 10.9.0.0 network, .1 gateway, .3 broadcast: only .2 usable.
        let ip = mgr.allocate_ip("tiny").expect("allocate");
        assert_eq!(ip, Ipv4Addr::new(10, 9, 0, 2));
    }

    #[test]
    fn exhaustion_is_an_error_and_leaves_state_unchanged() {
        let (_, mgr) = manager();
        small_net(&mgr);
        let ip = mgr.allocate_ip("tiny").expect("first allocation");
        let err = mgr.allocate_ip("tiny").unwrap_err();
        assert_eq!(err.code(), "resource_setup");
        // Releasing restores the original state.
        mgr.release_ip("tiny", ip);
        assert_eq!(mgr.allocate_ip("tiny").expect("after release"), ip);
    }

    #[test]
    fn allocate_release_roundtrip_is_identity() {
        let (_, mgr) = manager();
        let before: Vec<_> = mgr.list_networks();
        let ip = mgr.allocate_ip("bridge").expect("allocate");
        mgr.release_ip("bridge", ip);
        mgr.release_ip("bridge", ip); // idempotent
        let after: Vec<_> = mgr.list_networks();
        assert_eq!(before[0].allocated, after[0].allocated);
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let (_, mgr) = manager();
        let mgr = Arc::new(mgr);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let m = mgr.clone();
            handles.push(std::thread::spawn(move || m.allocate_ip("bridge").expect("allocate")));
        }
        let mut ips: Vec<Ipv4Addr> = handles.into_iter().map(|h| h.join().expect("join")).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 16);
    }

    #[test]
    fn lowest_free_index_wins() {
        let (_, mgr) = manager();
        let a = mgr.allocate_ip("bridge").expect("a");
        let b = mgr.allocate_ip("bridge").expect("b");
        assert!(a < b);
        mgr.release_ip("bridge", a);
        assert_eq!(mgr.allocate_ip("bridge").expect("re-allocate"), a);
    }

    #[test]
    fn remove_network_refused_while_attached() {
        let (_, mgr) = manager();
        small_net(&mgr);
        let ip = mgr.allocate_ip("tiny").expect("allocate");
        let alloc = mgr.make_allocation("job-1", "tiny", ip, 4321, Utc::now());
        mgr.assign_job(alloc).expect("assign");
        assert_eq!(mgr.remove_network("tiny").unwrap_err().code(), "invalid_state");
        mgr.remove_allocation("job-1");
        mgr.remove_network("tiny").expect("remove after detach");
    }

    #[test]
    fn builtin_network_cannot_be_removed() {
        let (_, mgr) = manager();
        assert_eq!(mgr.remove_network("bridge").unwrap_err().code(), "invalid_state");
    }

    #[test]
    fn veth_names_are_pid_derived() {
        assert_eq!(veth_names(54321), ("vjob4321".to_string(), "vjob4321p".to_string()));
        assert_eq!(veth_names(7), ("vjob7".to_string(), "vjob7p".to_string()));
    }

    #[test]
    fn setup_runs_the_ip_dance_in_order() {
        let (platform, mgr) = manager();
        let ip = mgr.allocate_ip("bridge").expect("allocate");
        let alloc = mgr.make_allocation("job-2", "bridge", ip, 1234, Utc::now());
        mgr.setup_job_network(&alloc, 1234).expect("setup");
        let commands = platform.commands_run();
        assert!(commands[0].1.starts_with(&["link".to_string(), "add".to_string()]));
        let nsenter_count = commands.iter().filter(|(p, _)| p == "nsenter").count();
        assert_eq!(nsenter_count, 4);
    }

    #[test]
    fn setup_failure_surfaces_stderr() {
        let (platform, mgr) = manager();
        platform.fail_command("ip");
        let ip = mgr.allocate_ip("bridge").expect("allocate");
        let alloc = mgr.make_allocation("job-3", "bridge", ip, 99, Utc::now());
        assert!(mgr.setup_job_network(&alloc, 99).is_err());
    }
}
