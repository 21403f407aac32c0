use std::fmt;

use sysinfo::{Pid, Process, ProcessesToUpdate, System};

use crate::{Batch, CounterType, Metric};

/// Name of the counter incremented on every poll.
pub const POLL_COUNT: &str = "PollCount";

/// Name of the gauge carrying a fresh random value on every poll.
pub const RANDOM_VALUE: &str = "RandomValue";

/// The sources a gauge accessor reads from.
struct Sources<'a> {
    system: &'a System,
    process: Option<&'a Process>,
}

type Accessor = fn(&Sources<'_>) -> Option<f64>;

fn nonzero(value: u64) -> Option<f64> {
    (value > 0).then_some(value as f64)
}

fn process<T>(sources: &Sources<'_>, f: impl FnOnce(&Process) -> T) -> Option<T> {
    sources.process.map(f)
}

/// All gauges read from the system and process on every poll.
///
/// Accessors return `None` if the source is unavailable on this platform, in which case the
/// gauge is omitted from the batch.
static GAUGES: &[(&str, Accessor)] = &[
    ("TotalMemory", |s| nonzero(s.system.total_memory())),
    ("FreeMemory", |s| nonzero(s.system.free_memory())),
    ("AvailableMemory", |s| nonzero(s.system.available_memory())),
    ("UsedMemory", |s| nonzero(s.system.used_memory())),
    ("TotalSwap", |s| nonzero(s.system.total_swap())),
    ("UsedSwap", |s| {
        (s.system.total_swap() > 0).then(|| s.system.used_swap() as f64)
    }),
    ("ProcessResidentMemory", |s| {
        process(s, |p| p.memory()).and_then(nonzero)
    }),
    ("ProcessVirtualMemory", |s| {
        process(s, |p| p.virtual_memory()).and_then(nonzero)
    }),
    ("ProcessCPUUsage", |s| process(s, |p| f64::from(p.cpu_usage()))),
    ("ProcessRunTime", |s| process(s, |p| p.run_time() as f64)),
    ("ProcessDiskRead", |s| {
        process(s, |p| p.disk_usage().total_read_bytes as f64)
    }),
    ("ProcessDiskWritten", |s| {
        process(s, |p| p.disk_usage().total_written_bytes as f64)
    }),
    ("LoadAverage1", |_| load_average(|l| l.one)),
    ("LoadAverage5", |_| load_average(|l| l.five)),
    ("LoadAverage15", |_| load_average(|l| l.fifteen)),
    ("Uptime", |_| nonzero(System::uptime())),
];

fn load_average(f: fn(&sysinfo::LoadAvg) -> f64) -> Option<f64> {
    if cfg!(windows) {
        return None;
    }

    Some(f(&System::load_average()))
}

/// Collects system and process metrics.
///
/// [`poll`](Self::poll) refreshes the latest snapshot and counts the poll,
/// [`take_batch`](Self::take_batch) returns the latest snapshot together with the number of polls
/// since the previous batch. Summed up on the server, `PollCount` equals the total number of polls.
///
/// ```
/// use tally_metrics::{MetricValue, Sampler};
///
/// let mut sampler = Sampler::new();
/// sampler.poll();
/// sampler.poll();
///
/// let batch = sampler.take_batch();
/// let poll_count = batch.iter().find(|m| m.name == "PollCount").unwrap();
/// assert_eq!(poll_count.value, MetricValue::Counter(2));
/// ```
pub struct Sampler {
    system: System,
    pid: Option<Pid>,
    poll_count: CounterType,
    latest: Batch,
}

impl Sampler {
    /// Creates a sampler for the current process.
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(error) => {
                tally_log::debug!("process metrics unavailable: {error}");
                None
            }
        };

        Self {
            system: System::new(),
            pid,
            poll_count: 0,
            latest: Batch::new(),
        }
    }

    /// Refreshes all sources and replaces the latest snapshot.
    pub fn poll(&mut self) {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        if let Some(pid) = self.pid {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }

        let sources = Sources {
            system: &self.system,
            process: self.pid.and_then(|pid| self.system.process(pid)),
        };

        let mut batch = Batch::with_capacity(GAUGES.len() + self.system.cpus().len() + 2);
        for (name, accessor) in GAUGES {
            if let Some(value) = accessor(&sources) {
                batch.push(Metric::gauge(*name, value));
            }
        }

        for (index, cpu) in self.system.cpus().iter().enumerate() {
            let name = format!("CPUutilization{}", index + 1);
            batch.push(Metric::gauge(name, f64::from(cpu.cpu_usage())));
        }

        batch.push(Metric::gauge(RANDOM_VALUE, rand::random::<f64>()));

        self.latest = batch;
        self.poll_count = self.poll_count.saturating_add(1);
    }

    /// Returns the latest snapshot and the polls since the previous call, resetting the count.
    pub fn take_batch(&mut self) -> Batch {
        let mut batch = self.latest.clone();
        batch.push(Metric::counter(POLL_COUNT, self.poll_count));
        self.poll_count = 0;
        batch
    }

    /// Polls once and returns the resulting batch.
    pub fn sample(&mut self) -> Batch {
        self.poll();
        self.take_batch()
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("pid", &self.pid)
            .field("poll_count", &self.poll_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::{MetricType, MetricValue};

    use super::*;

    fn find<'a>(batch: &'a Batch, name: &str) -> Option<&'a Metric> {
        batch.iter().find(|metric| metric.name == name)
    }

    #[test]
    fn test_poll_count_is_delta() {
        let mut sampler = Sampler::new();
        sampler.poll();
        sampler.poll();
        sampler.poll();

        let batch = sampler.take_batch();
        assert_eq!(
            find(&batch, POLL_COUNT).unwrap().value,
            MetricValue::Counter(3)
        );

        let batch = sampler.take_batch();
        assert_eq!(
            find(&batch, POLL_COUNT).unwrap().value,
            MetricValue::Counter(0)
        );
    }

    #[test]
    fn test_random_value_in_range() {
        let mut sampler = Sampler::new();
        let batch = sampler.sample();

        let MetricValue::Gauge(value) = find(&batch, RANDOM_VALUE).unwrap().value else {
            panic!("RandomValue must be a gauge");
        };
        assert!((0.0..1.0).contains(&value));
    }

    #[test]
    fn test_names_unique() {
        let batch = Sampler::new().sample();
        let names = batch.iter().map(|m| m.name.as_str()).collect::<BTreeSet<_>>();
        assert_eq!(names.len(), batch.len());
    }

    #[test]
    fn test_only_poll_count_is_counter() {
        let batch = Sampler::new().sample();
        for metric in &batch {
            let expected = if metric.name == POLL_COUNT {
                MetricType::Counter
            } else {
                MetricType::Gauge
            };
            assert_eq!(metric.ty(), expected, "{}", metric.name);
        }
    }

    #[test]
    fn test_cpu_gauges_one_based() {
        let batch = Sampler::new().sample();
        if batch.iter().any(|m| m.name.starts_with("CPUutilization")) {
            assert!(find(&batch, "CPUutilization1").is_some());
            assert!(find(&batch, "CPUutilization0").is_none());
        }
    }

    #[test]
    fn test_take_before_poll() {
        let batch = Sampler::new().take_batch();
        assert_eq!(batch, vec![Metric::counter(POLL_COUNT, 0)]);
    }
}
