//! Multi-host topology and step agreement
//!
//! Every host runs its own pipeline. Before a global batch is handed to the
//! training step, all hosts exchange a small [`StepReport`] so they agree on
//! the step index and on the shape of each host's shard. The exchange only
//! aligns indices and shapes; batch contents never cross hosts.

use candle_core::Device;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Position of this process among the data-loading hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAssignment {
    /// This host's index (0 to host_count-1)
    pub host_index: usize,
    /// Total number of data-loading hosts
    pub host_count: usize,
}

impl Default for HostAssignment {
    fn default() -> Self {
        Self {
            host_index: 0,
            host_count: 1,
        }
    }
}

impl HostAssignment {
    pub fn new(host_index: usize, host_count: usize) -> Result<Self> {
        if host_count == 0 || host_index >= host_count {
            return Err(Error::config(format!(
                "host index {} is outside 0..{}",
                host_index, host_count
            )));
        }
        Ok(Self {
            host_index,
            host_count,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.host_count > 1
    }

    pub fn is_main_process(&self) -> bool {
        self.host_index == 0
    }

    /// Whether the record at stream `position` belongs to this host.
    pub fn owns(&self, position: usize) -> bool {
        position % self.host_count == self.host_index
    }
}

/// Logical grid of accelerator devices, split evenly across hosts.
#[derive(Debug, Clone)]
pub struct DeviceMesh {
    device_count: usize,
    host_count: usize,
    local_devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(device_count: usize, host_count: usize, local_devices: Vec<Device>) -> Result<Self> {
        if host_count == 0 || device_count == 0 || device_count % host_count != 0 {
            return Err(Error::config(format!(
                "{} devices cannot be split evenly over {} hosts",
                device_count, host_count
            )));
        }
        if local_devices.len() != device_count / host_count {
            return Err(Error::config(format!(
                "expected {} local devices, got {}",
                device_count / host_count,
                local_devices.len()
            )));
        }
        Ok(Self {
            device_count,
            host_count,
            local_devices,
        })
    }

    /// Mesh whose local devices are all the host CPU.
    pub fn cpu(device_count: usize, host_count: usize) -> Result<Self> {
        let local = if host_count == 0 { 0 } else { device_count / host_count };
        Self::new(device_count, host_count, vec![Device::Cpu; local])
    }

    /// Total number of devices across all hosts.
    pub fn size(&self) -> usize {
        self.device_count
    }

    pub fn host_count(&self) -> usize {
        self.host_count
    }

    pub fn local_devices(&self) -> &[Device] {
        &self.local_devices
    }

    /// Per-host batch size for `global_batch_size`, which must divide evenly
    /// over every device in the mesh.
    pub fn per_host_batch_size(&self, global_batch_size: usize) -> Result<usize> {
        if global_batch_size == 0 || global_batch_size % self.device_count != 0 {
            return Err(Error::config(format!(
                "global batch size {} is not divisible by the {} devices in the mesh",
                global_batch_size, self.device_count
            )));
        }
        Ok(global_batch_size / self.host_count)
    }
}

/// What one host announces at a step boundary. `shape` is `None` when the
/// host has no batch left for this epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub host_index: usize,
    pub step: u64,
    pub shape: Option<Vec<usize>>,
}

/// Blocking all-gather of step reports. Every host must call it once per
/// step; it returns the reports of all hosts ordered by host index.
pub trait Collective: Send + Sync {
    fn all_gather(&self, report: StepReport) -> Result<Vec<StepReport>>;
}

/// Collective for a single data-loading host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleHost;

impl Collective for SingleHost {
    fn all_gather(&self, report: StepReport) -> Result<Vec<StepReport>> {
        Ok(vec![report])
    }
}

#[derive(Default)]
struct Round {
    reports: Vec<Option<StepReport>>,
    taken: usize,
}

struct GroupShared {
    host_count: usize,
    timeout: Duration,
    rounds: Mutex<BTreeMap<u64, Round>>,
    ready: Condvar,
}

/// Hosts simulated by threads of one process.
#[derive(Clone)]
pub struct InProcessGroup {
    host_index: usize,
    shared: Arc<GroupShared>,
}

impl InProcessGroup {
    /// One handle per host, index `i` belonging to host `i`.
    pub fn new(host_count: usize, timeout: Duration) -> Vec<Self> {
        let shared = Arc::new(GroupShared {
            host_count,
            timeout,
            rounds: Mutex::new(BTreeMap::new()),
            ready: Condvar::new(),
        });
        (0..host_count)
            .map(|host_index| Self {
                host_index,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for InProcessGroup {
    fn all_gather(&self, report: StepReport) -> Result<Vec<StepReport>> {
        if report.host_index != self.host_index {
            return Err(Error::Rendezvous(format!(
                "handle of host {} used to report for host {}",
                self.host_index, report.host_index
            )));
        }
        let n = self.shared.host_count;
        let step = report.step;
        let deadline = Instant::now() + self.shared.timeout;

        let mut rounds = self.shared.rounds.lock();
        let round = rounds.entry(step).or_default();
        if round.reports.is_empty() {
            round.reports = vec![None; n];
        }
        if round.reports[self.host_index].is_some() {
            return Err(Error::Rendezvous(format!(
                "host {} reported step {} twice",
                self.host_index, step
            )));
        }
        round.reports[self.host_index] = Some(report);
        self.shared.ready.notify_all();

        loop {
            let round = rounds
                .get_mut(&step)
                .ok_or_else(|| Error::Rendezvous(format!("step {} vanished", step)))?;
            if round.reports.iter().all(Option::is_some) {
                let reports: Vec<StepReport> = round.reports.iter().flatten().cloned().collect();
                round.taken += 1;
                if round.taken == n {
                    rounds.remove(&step);
                }
                return Ok(reports);
            }
            if self
                .shared
                .ready
                .wait_until(&mut rounds, deadline)
                .timed_out()
            {
                return Err(Error::Rendezvous(format!(
                    "host {} timed out waiting for step {}",
                    self.host_index, step
                )));
            }
        }
    }
}

/// Hosts exchange step reports through a shared directory.
///
/// Each host writes its report to a temporary file and renames it into
/// place, then polls until every host's report for the step exists. The
/// directory must be fresh for each run.
pub struct FileRendezvous {
    dir: PathBuf,
    host_index: usize,
    host_count: usize,
    poll_interval: Duration,
    timeout: Duration,
}

impl FileRendezvous {
    pub fn new<P: AsRef<Path>>(dir: P, host: HostAssignment, timeout: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let suffix = host_suffix(host.host_index);
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
            {
                warn!("Host {}: removing stale report {:?}", host.host_index, path);
                let _ = std::fs::remove_file(&path);
            }
        }

        info!(
            "Host {}/{}: rendezvous through {:?}",
            host.host_index, host.host_count, dir
        );
        Ok(Self {
            dir,
            host_index: host.host_index,
            host_count: host.host_count,
            poll_interval: Duration::from_millis(10),
            timeout,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn report_path(&self, step: u64, host_index: usize) -> PathBuf {
        self.dir
            .join(format!("step-{:012}{}", step, host_suffix(host_index)))
    }

    fn read_report(&self, step: u64, host_index: usize) -> Result<Option<StepReport>> {
        let path = self.report_path(step, host_index);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn host_suffix(host_index: usize) -> String {
    format!("-host-{:05}.json", host_index)
}

impl Collective for FileRendezvous {
    fn all_gather(&self, report: StepReport) -> Result<Vec<StepReport>> {
        let step = report.step;
        let path = self.report_path(step, self.host_index);

        // Write to a temporary file then rename so readers never see a partial report
        let tmp = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(&report)?)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;

        let deadline = Instant::now() + self.timeout;
        let mut reports: Vec<Option<StepReport>> = vec![None; self.host_count];
        loop {
            for (host, slot) in reports.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = self.read_report(step, host)?;
                }
            }
            if reports.iter().all(Option::is_some) {
                break;
            }
            if Instant::now() >= deadline {
                let missing: Vec<usize> = reports
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.is_none())
                    .map(|(i, _)| i)
                    .collect();
                return Err(Error::Rendezvous(format!(
                    "host {} timed out at step {} waiting for hosts {:?}",
                    self.host_index, step, missing
                )));
            }
            std::thread::sleep(self.poll_interval);
        }

        // Every host has finished reading the previous step once it wrote this one
        if step > 0 {
            let _ = std::fs::remove_file(self.report_path(step - 1, self.host_index));
        }
        debug!("Host {}: step {} agreed", self.host_index, step);

        Ok(reports.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn report(host_index: usize, step: u64, shape: Option<Vec<usize>>) -> StepReport {
        StepReport {
            host_index,
            step,
            shape,
        }
    }

    #[test]
    fn test_host_assignment_partition() {
        let hosts: Vec<HostAssignment> = (0..3)
            .map(|i| HostAssignment::new(i, 3).unwrap())
            .collect();
        for position in 0..30 {
            let owners = hosts.iter().filter(|h| h.owns(position)).count();
            assert_eq!(owners, 1);
        }
        assert!(HostAssignment::new(3, 3).is_err());
        assert!(HostAssignment::new(0, 0).is_err());
    }

    #[test]
    fn test_mesh_batch_size_divisibility() {
        let mesh = DeviceMesh::cpu(8, 2).unwrap();
        assert_eq!(mesh.local_devices().len(), 4);
        assert_eq!(mesh.per_host_batch_size(16).unwrap(), 8);
        assert!(matches!(
            mesh.per_host_batch_size(12),
            Err(Error::Configuration(_))
        ));
        assert!(DeviceMesh::cpu(3, 2).is_err());
        assert!(DeviceMesh::new(4, 2, vec![Device::Cpu]).is_err());
    }

    #[test]
    fn test_in_process_group_gathers_all_hosts() {
        let handles = InProcessGroup::new(3, Duration::from_secs(5));
        let threads: Vec<_> = handles
            .into_iter()
            .enumerate()
            .map(|(i, group)| {
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for step in 0..4u64 {
                        let reports = group.all_gather(report(i, step, Some(vec![i, 2]))).unwrap();
                        seen.push(reports);
                    }
                    seen
                })
            })
            .collect();

        for t in threads {
            let seen = t.join().unwrap();
            for (step, reports) in seen.iter().enumerate() {
                assert_eq!(reports.len(), 3);
                for (host, r) in reports.iter().enumerate() {
                    assert_eq!(r, &report(host, step as u64, Some(vec![host, 2])));
                }
            }
        }
    }

    #[test]
    fn test_in_process_group_times_out_on_missing_host() {
        let handles = InProcessGroup::new(2, Duration::from_millis(50));
        let err = handles[0].all_gather(report(0, 0, None)).unwrap_err();
        assert!(matches!(err, Error::Rendezvous(_)));
    }

    #[test]
    fn test_file_rendezvous_between_threads() {
        let dir = tempfile::tempdir().unwrap();
        let threads: Vec<_> = (0..2)
            .map(|i| {
                let path = dir.path().to_path_buf();
                thread::spawn(move || {
                    let host = HostAssignment::new(i, 2).unwrap();
                    let rendezvous = FileRendezvous::new(&path, host, Duration::from_secs(10))
                        .unwrap()
                        .with_poll_interval(Duration::from_millis(1));
                    (0..3u64)
                        .map(|step| {
                            let shape = if step == 2 && i == 1 { None } else { Some(vec![4, 8]) };
                            rendezvous.all_gather(report(i, step, shape)).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for t in threads {
            let rounds = t.join().unwrap();
            assert_eq!(rounds[0][1].shape, Some(vec![4, 8]));
            assert_eq!(rounds[2][1].shape, None);
            assert_eq!(rounds[2][0].shape, Some(vec![4, 8]));
        }
    }
}
