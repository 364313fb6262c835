//! Per-scrape collection of compute-unit metrics.

use std::sync::{atomic::AtomicU64, Arc};
use std::time::Duration;

use prometheus_client::{
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};
use tokio::task::JoinSet;
use util_cgroups::{CgroupManager, CgroupMetric, HostInfo, StatsReader};

type Labels = Vec<(String, String)>;
type GaugeF64 = Gauge<f64, AtomicU64>;

/// Which optional metric groups are exposed.
#[derive(Debug, Clone, Copy)]
pub struct CollectorOpts {
    pub swap: bool,
    pub blkio: bool,
    pub psi: bool,
}

/// Collects the statistics of every live compute unit on each scrape.
pub struct ComputeCollector {
    manager: Arc<CgroupManager>,
    reader: Arc<dyn StatsReader>,
    opts: CollectorOpts,
    hostname: String,
    scrape_timeout: Duration,
}

impl ComputeCollector {
    pub fn new(
        manager: CgroupManager,
        host: HostInfo,
        opts: CollectorOpts,
        hostname: String,
        scrape_timeout: Duration,
    ) -> Self {
        let reader = util_cgroups::reader_for(&manager, host);
        Self {
            manager: Arc::new(manager),
            reader,
            opts,
            hostname,
            scrape_timeout,
        }
    }

    /// Runs one scrape: discovery, then one parallel stats read per unit,
    /// then a fresh registry mirroring exactly the units alive right now.
    ///
    /// A discovery failure is one logged error and an empty exposition.
    /// Units whose read misses the scrape deadline are emitted with zeroed
    /// fields and the error flag set.
    pub async fn collect(&self) -> Registry {
        let mut registry = Registry::default();

        let manager = Arc::clone(&self.manager);
        let discovered = match tokio::task::spawn_blocking(move || manager.discover()).await {
            Ok(Ok(cgroups)) => cgroups,
            Ok(Err(err)) => {
                log::error!("cgroup discovery failed: {err}");
                return registry;
            }
            Err(err) => {
                log::error!("cgroup discovery task failed: {err}");
                return registry;
            }
        };

        // One worker per unit; each one owns its pre-allocated metric, so no
        // locking is needed anywhere.
        let mut tasks: JoinSet<(usize, CgroupMetric)> = JoinSet::new();
        for (index, cgroup) in discovered.iter().enumerate() {
            let reader = Arc::clone(&self.reader);
            let mut metric = CgroupMetric::new(cgroup.path.clone(), cgroup.uuid.clone());
            tasks.spawn_blocking(move || {
                reader.read(&mut metric);
                (index, metric)
            });
        }

        let mut finished: Vec<Option<CgroupMetric>> = (0..discovered.len()).map(|_| None).collect();
        let deadline = tokio::time::sleep(self.scrape_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                next = tasks.join_next() => match next {
                    Some(Ok((index, metric))) => finished[index] = Some(metric),
                    Some(Err(err)) => log::error!("stats read task failed: {err}"),
                    None => break,
                },
                _ = &mut deadline => {
                    log::error!("scrape deadline reached with {} stats reads pending", tasks.len());
                    tasks.abort_all();
                    break;
                }
            }
        }

        let metrics: Vec<CgroupMetric> = discovered
            .iter()
            .zip(finished)
            .map(|(cgroup, metric)| {
                metric.unwrap_or_else(|| {
                    let mut incomplete = CgroupMetric::new(cgroup.path.clone(), cgroup.uuid.clone());
                    incomplete.err = true;
                    incomplete
                })
            })
            .collect();

        self.encode_into(&mut registry, &metrics);
        registry
    }

    fn unit_labels(&self, uuid: &str) -> Labels {
        vec![
            ("manager".to_string(), self.manager.resource_manager().as_str().to_string()),
            ("hostname".to_string(), self.hostname.clone()),
            ("uuid".to_string(), uuid.to_string()),
        ]
    }

    fn encode_into(&self, registry: &mut Registry, metrics: &[CgroupMetric]) {
        let register = |registry: &mut Registry, name: &str, help: &str| {
            let family = Family::<Labels, GaugeF64>::default();
            registry.register(name, help, family.clone());
            family
        };

        let units = register(registry, "compute_units", "Total number of compute units");
        units
            .get_or_create(&vec![
                ("manager".to_string(), self.manager.resource_manager().as_str().to_string()),
                ("hostname".to_string(), self.hostname.clone()),
            ])
            .set(metrics.len() as f64);

        let cpu_user = register(
            registry,
            "compute_unit_cpu_user_seconds_total",
            "Total compute unit CPU user seconds",
        );
        let cpu_system = register(
            registry,
            "compute_unit_cpu_system_seconds_total",
            "Total compute unit CPU system seconds",
        );
        let cpus = register(registry, "compute_unit_cpus", "Total number of compute unit CPUs");
        let memory_rss = register(registry, "compute_unit_memory_rss_bytes", "Memory RSS used in bytes");
        let memory_cache = register(
            registry,
            "compute_unit_memory_cache_bytes",
            "Memory cache used in bytes",
        );
        let memory_used = register(registry, "compute_unit_memory_used_bytes", "Memory used in bytes");
        let memory_total = register(registry, "compute_unit_memory_total_bytes", "Memory total in bytes");
        let memory_fail = register(registry, "compute_unit_memory_fail_count", "Memory fail count");
        let collect_error = register(
            registry,
            "compute_collect_error",
            "Indicates collection error, 0=no error, 1=error",
        );

        let swap = self.opts.swap.then(|| {
            (
                register(registry, "compute_unit_memsw_used_bytes", "Swap used in bytes"),
                register(registry, "compute_unit_memsw_total_bytes", "Swap total in bytes"),
                register(registry, "compute_unit_memsw_fail_count", "Swap fail count"),
            )
        });
        let blkio = self.opts.blkio.then(|| {
            (
                register(registry, "compute_unit_blkio_read_total_bytes", "Total block IO read bytes"),
                register(
                    registry,
                    "compute_unit_blkio_write_total_bytes",
                    "Total block IO write bytes",
                ),
                register(
                    registry,
                    "compute_unit_blkio_read_total_requests",
                    "Total block IO read requests",
                ),
                register(
                    registry,
                    "compute_unit_blkio_write_total_requests",
                    "Total block IO write requests",
                ),
            )
        });
        let psi = self.opts.psi.then(|| {
            (
                register(registry, "compute_unit_cpu_psi_seconds", "Total CPU PSI in seconds"),
                register(registry, "compute_unit_memory_psi_seconds", "Total memory PSI in seconds"),
                register(registry, "compute_unit_blkio_psi_seconds", "Total block IO PSI in seconds"),
            )
        });
        let rdma_handles = register(
            registry,
            "compute_unit_rdma_hca_handles",
            "Current number of RDMA HCA handles",
        );
        let rdma_objects = register(
            registry,
            "compute_unit_rdma_hca_objects",
            "Current number of RDMA HCA objects",
        );

        for m in metrics {
            let labels = self.unit_labels(&m.uuid);

            cpu_user.get_or_create(&labels).set(m.cpu_user);
            cpu_system.get_or_create(&labels).set(m.cpu_system);
            cpus.get_or_create(&labels).set(m.cpus as f64);

            memory_rss.get_or_create(&labels).set(m.memory_rss);
            memory_cache.get_or_create(&labels).set(m.memory_cache);
            memory_used.get_or_create(&labels).set(m.memory_used);
            memory_total.get_or_create(&labels).set(m.memory_total);
            memory_fail.get_or_create(&labels).set(m.memory_fail_count);

            if let Some((used, total, fail)) = &swap {
                used.get_or_create(&labels).set(m.memsw_used);
                total.get_or_create(&labels).set(m.memsw_total);
                fail.get_or_create(&labels).set(m.memsw_fail_count);
            }

            if let Some((read_bytes, write_bytes, read_reqs, write_reqs)) = &blkio {
                for (family, samples) in [
                    (read_bytes, &m.blkio_read_bytes),
                    (write_bytes, &m.blkio_write_bytes),
                    (read_reqs, &m.blkio_read_reqs),
                    (write_reqs, &m.blkio_write_reqs),
                ] {
                    for (device, value) in samples {
                        if *value > 0.0 {
                            family.get_or_create(&with_device(&labels, device)).set(*value);
                        }
                    }
                }
            }

            if let Some((cpu_psi, memory_psi, blkio_psi)) = &psi {
                cpu_psi.get_or_create(&labels).set(m.cpu_psi);
                memory_psi.get_or_create(&labels).set(m.memory_psi);
                blkio_psi.get_or_create(&labels).set(m.blkio_psi);
            }

            for (device, value) in &m.rdma_hca_handles {
                if *value > 0.0 {
                    rdma_handles.get_or_create(&with_device(&labels, device)).set(*value);
                }
            }
            for (device, value) in &m.rdma_hca_objects {
                if *value > 0.0 {
                    rdma_objects.get_or_create(&with_device(&labels, device)).set(*value);
                }
            }

            collect_error
                .get_or_create(&labels)
                .set(if m.err { 1.0 } else { 0.0 });
        }
    }
}

fn with_device(labels: &Labels, device: &str) -> Labels {
    let mut labels = labels.clone();
    labels.push(("device".to_string(), device.to_string()));
    labels
}
