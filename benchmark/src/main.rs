use std::{
    collections::HashMap,
    num::{NonZeroU64, NonZeroUsize},
    ops::ControlFlow,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use clap::Parser;
use crossbeam_utils::CachePadded;
use dsched::{ClientId, Direction, Scheduler, SchedulerConfig};
use hdrhistogram::Counter;
use itertools::Itertools;
use rand::Rng;
use serde_with::serde_as;
use tracing::{error, info};

mod sim_disk;

use sim_disk::SimDisk;

#[serde_as]
#[derive(serde::Serialize, clap::Parser, Clone)]
struct Args {
    num_clients: NonZeroU64,
    block_size_shift: NonZeroU64,
    #[clap(value_enum)]
    policy: PolicyKind,
    #[clap(long, default_value = "until-ctrl-c")]
    run_duration: RunDuration,
    /// Requests each client keeps outstanding.
    #[clap(long, default_value = "4")]
    client_queue_depth: NonZeroUsize,
    /// Requests the simulated device serves in parallel.
    #[clap(long, default_value = "8")]
    device_depth: NonZeroUsize,
    #[clap(long, default_value = "100us", value_parser = humantime::parse_duration)]
    #[serde_as(as = "serde_with::DurationMicroSeconds")]
    service_time: Duration,
    /// Percentage of requests that are reads.
    #[clap(long, default_value = "70", value_parser = clap::value_parser!(u8).range(0..=100))]
    read_percent: u8,
    /// fq only: in-flight limit for every client; 0 means unlimited.
    #[clap(long, default_value = "0")]
    fq_max_throughput: u64,
    /// bfq only.
    #[clap(long, default_value = "on")]
    bfq_anticipation: Switch,
    /// bfq only.
    #[clap(long, default_value = "off")]
    bfq_auto_max_budget: Switch,
}

#[derive(Clone, Copy, clap::ValueEnum, serde::Serialize)]
enum PolicyKind {
    Noop,
    Fq,
    Bfq,
}

impl PolicyKind {
    fn name(&self) -> &'static str {
        match self {
            PolicyKind::Noop => dsched::policy::noop::NAME,
            PolicyKind::Fq => dsched::policy::fq::NAME,
            PolicyKind::Bfq => dsched::policy::bfq::NAME,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum, serde::Serialize)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn on(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[derive(Clone, serde::Serialize)]
enum RunDuration {
    UntilCtrlC,
    FixedDuration(Duration),
    FixedTotalIoCount(u64),
    FixedPerClientIoCount(u64),
}

fn parse_io_count(s: &str, suffix: &str) -> Result<u64, String> {
    let stripped = &s[..s.len() - suffix.len()];
    let (stripped, multiplier) = if let Some(n) = stripped.strip_suffix("k-") {
        (n, 1000)
    } else if let Some(n) = stripped.strip_suffix("m-") {
        (n, 1000 * 1000)
    } else if let Some(n) = stripped.strip_suffix("g-") {
        (n, 1000 * 1000 * 1000)
    } else {
        (stripped.strip_suffix('-').unwrap_or(stripped), 1)
    };
    match stripped.parse::<NonZeroU64>() {
        Ok(n) => Ok(n.get() * multiplier),
        Err(e) => Err(format!("invalid io count: {e}: {s:?}")),
    }
}

impl FromStr for RunDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "until-ctrl-c" => Ok(RunDuration::UntilCtrlC),
            x if x.ends_with("ios-total") => {
                parse_io_count(x, "ios-total").map(RunDuration::FixedTotalIoCount)
            }
            x if x.ends_with("ios-per-client") => {
                parse_io_count(x, "ios-per-client").map(RunDuration::FixedPerClientIoCount)
            }
            x => match humantime::parse_duration(x) {
                Ok(d) => Ok(RunDuration::FixedDuration(d)),
                Err(e) => Err(format!("invalid duration: {e}: {s:?}")),
            },
        }
    }
}

struct StatsState {
    ops_in_last_second: Vec<CachePadded<AtomicU64>>,
    latencies_histo: Vec<CachePadded<Mutex<hdrhistogram::Histogram<u64>>>>,
}

impl StatsState {
    fn make_latency_histogram() -> hdrhistogram::Histogram<u64> {
        hdrhistogram::Histogram::new_with_bounds(1, 1_000_000_000, 3).unwrap()
    }
    fn record_iop_latency(&self, client_num: usize, latency: Duration) {
        let mut h = self.latencies_histo[client_num].lock().unwrap();
        h.saturating_record(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));
    }
}

#[derive(Clone)]
struct OpsLeft(Option<Arc<AtomicI64>>);

impl OpsLeft {
    fn take_one_op(&self) -> ControlFlow<()> {
        match &self.0 {
            None => (),
            Some(ops_left) => {
                let ops_left = ops_left.fetch_sub(1, Ordering::Relaxed);
                if ops_left <= 0 {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

fn setup_ops_left(args: &Args) -> Vec<OpsLeft> {
    let shared_total = match args.run_duration {
        RunDuration::FixedTotalIoCount(total) => Some(Arc::new(AtomicI64::new(
            i64::try_from(total).unwrap(),
        ))),
        _ => None,
    };
    (0..args.num_clients.get())
        .map(|_| match args.run_duration {
            RunDuration::UntilCtrlC | RunDuration::FixedDuration(_) => OpsLeft(None),
            RunDuration::FixedTotalIoCount(_) => OpsLeft(shared_total.clone()),
            RunDuration::FixedPerClientIoCount(per_client) => OpsLeft(Some(Arc::new(
                AtomicI64::new(i64::try_from(per_client).unwrap()),
            ))),
        })
        .collect()
}

struct RunResult {
    client_run_times: Vec<Duration>,
}

const MONITOR_PERIOD: Duration = Duration::from_secs(1);
const DISK_SIZE: u64 = 1 << 30;

fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter({
            tracing_subscriber::EnvFilter::try_from_default_env()
                .expect("must set RUST_LOG variable")
        })
        .init();

    let args: Arc<Args> = Arc::new(Args::parse());
    let num_clients = usize::try_from(args.num_clients.get()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let (stop_monitor_tx, stop_monitor_rx) = tokio::sync::oneshot::channel::<RunResult>();

    let stats_state = Arc::new(StatsState {
        ops_in_last_second: (0..num_clients)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect(),
        latencies_histo: (0..num_clients)
            .map(|_| CachePadded::new(Mutex::new(StatsState::make_latency_histogram())))
            .collect(),
    });

    match args.run_duration {
        RunDuration::UntilCtrlC => {}
        RunDuration::FixedDuration(duration) => {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(duration);
                info!("configured runtime expired, setting stop flag");
                stop.store(true, Ordering::Relaxed);
            });
        }
        RunDuration::FixedTotalIoCount(_) | RunDuration::FixedPerClientIoCount(_) => {
            // enforced through OpsLeft
        }
    }

    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || {
            info!("ctrl-c, setting stop flag");
            if stop.fetch_or(true, Ordering::Relaxed) {
                error!("stop flag was already set, aborting");
                std::process::abort();
            } else {
                info!("first ctrl-c, stop flag set");
            }
        }
    })
    .unwrap();

    let clients_and_monitor_ready = Arc::new(tokio::sync::Barrier::new(num_clients + 1));

    let monitor = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn({
            let stats_state = Arc::clone(&stats_state);
            let args = Arc::clone(&args);
            let clients_and_monitor_ready = Arc::clone(&clients_and_monitor_ready);
            move || monitor(args, stats_state, clients_and_monitor_ready, stop_monitor_rx)
        })
        .unwrap();

    let res = run_clients(
        Arc::clone(&args),
        setup_ops_left(&args),
        clients_and_monitor_ready,
        stop,
        stats_state,
    );
    stop_monitor_tx
        .send(res)
        .ok()
        .expect("monitor must not exit by itself");
    monitor.join().unwrap();
}

fn scheduler_config(args: &Args) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.default_policy = Some(args.policy.name().to_owned());
    config.fq.default_max_throughput = args.fq_max_throughput;
    config.bfq.anticipation = args.bfq_anticipation.on();
    config.bfq.auto_max_budget = args.bfq_auto_max_budget.on();
    config.bfq.max_tag_queue_depth = args.device_depth.get();
    config
}

fn run_clients(
    args: Arc<Args>,
    ops_left: Vec<OpsLeft>,
    clients_ready: Arc<tokio::sync::Barrier>,
    stop: Arc<AtomicBool>,
    stats_state: Arc<StatsState>,
) -> RunResult {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let disk = SimDisk::new("sim0", args.device_depth.get(), args.service_time);
    let scheduler = Scheduler::new(scheduler_config(&args));
    let ctx = scheduler.attach_disk(disk.clone()).unwrap();
    info!(policy = %ctx.policy_name(), "attached simulated disk");
    let block_size = 1u64 << args.block_size_shift.get();

    let client_run_times = rt.block_on(async {
        let tasks: Vec<_> = ops_left
            .into_iter()
            .enumerate()
            .map(|(client_num, ops_left)| {
                let ctx = ctx.clone();
                let stop = Arc::clone(&stop);
                let stats_state = Arc::clone(&stats_state);
                let clients_ready = Arc::clone(&clients_ready);
                let read_percent = args.read_percent;
                let queue_depth = args.client_queue_depth.get();
                tokio::spawn(async move {
                    let client = ctx
                        .on_client_attach(ClientId(client_num as u64))
                        .unwrap();
                    clients_ready.wait().await;
                    let start = std::time::Instant::now();
                    let slots = (0..queue_depth).map(|_| {
                        let ctx = ctx.clone();
                        let client = client.clone();
                        let stop = Arc::clone(&stop);
                        let stats_state = Arc::clone(&stats_state);
                        let ops_left = ops_left.clone();
                        async move {
                            while !stop.load(Ordering::Relaxed) {
                                if let ControlFlow::Break(()) = ops_left.take_one_op() {
                                    break;
                                }
                                let (direction, offset) = {
                                    let mut rng = rand::thread_rng();
                                    let direction = if rng.gen_range(0..100) < read_percent {
                                        Direction::Read
                                    } else {
                                        Direction::Write
                                    };
                                    let offset = rng.gen_range(0..DISK_SIZE / block_size) * block_size;
                                    (direction, offset)
                                };
                                let op_start = std::time::Instant::now();
                                let completion = ctx
                                    .submit_async(Some(&client), direction, offset, block_size)
                                    .await;
                                if let Err(e) = completion.result {
                                    error!(client_num, %e, "request failed");
                                    continue;
                                }
                                stats_state.record_iop_latency(client_num, op_start.elapsed());
                                stats_state.ops_in_last_second[client_num]
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                    futures::future::join_all(slots).await;
                    ctx.on_client_exit(client);
                    start.elapsed()
                })
            })
            .collect();
        let mut run_times = Vec::with_capacity(tasks.len());
        for task in tasks {
            run_times.push(task.await.unwrap());
        }
        run_times
    });

    if let Some(diag) = dsched::policy::bfq::diagnostics::lookup(ctx.name()) {
        info!("bfq diagnostics: {:?}", diag.snapshot());
    }
    let outcome = rt.block_on(ctx.detach());
    info!(?outcome, "detached");
    disk.shutdown();
    info!(
        raw_served = disk.raw_served.load(Ordering::Relaxed),
        "metrics: {:?}",
        dsched::metrics::global()
    );
    RunResult { client_run_times }
}

struct AggregatedStats {
    start: std::time::Instant,
    op_count: u64,
    op_size: u64,
    latencies_histo: hdrhistogram::Histogram<u64>,
}

const LATENCY_PERCENTILES: [f64; 7] = [50.0, 90.0, 99.0, 99.9, 99.99, 99.999, 99.9999];

fn latency_percentiles_serialize<S>(
    values: &[f64; LATENCY_PERCENTILES.len()],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serde::Serialize::serialize(
        &LATENCY_PERCENTILES
            .iter()
            .map(|p| format!("p{p}"))
            .zip(values.iter().cloned())
            .collect::<HashMap<_, _>>(),
        serializer,
    )
}

#[serde_as]
#[derive(serde::Serialize)]
struct AggregatedStatsSummary {
    #[serde_as(as = "serde_with::DurationMicroSeconds")]
    elapsed_us: std::time::Duration,
    throughput_iops: f64,
    throughput_bw_mibps: f64,
    latency_min_us: f64,
    latency_mean_us: f64,
    latency_max_us: f64,
    #[serde(serialize_with = "latency_percentiles_serialize")]
    latency_percentiles: [f64; LATENCY_PERCENTILES.len()],
}

impl std::fmt::Display for AggregatedStatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{:.2} TP: iops={:.0} bw={:.2} LAT(us): min={:.0} mean={:.0} max={:.0} {}",
            self.elapsed_us.as_secs_f64(),
            self.throughput_iops,
            self.throughput_bw_mibps,
            self.latency_min_us,
            self.latency_mean_us,
            self.latency_max_us,
            self.latency_percentiles
                .iter()
                .zip(LATENCY_PERCENTILES.iter())
                .map(|(v, p)| format!("p{p}={v:.0}"))
                .join(" "),
        )
    }
}

impl AggregatedStats {
    fn new(op_size: u64) -> Self {
        Self {
            start: std::time::Instant::now(),
            op_count: 0,
            op_size,
            latencies_histo: StatsState::make_latency_histogram(),
        }
    }
    fn reset(&mut self, start: std::time::Instant) {
        self.start = start;
        self.op_count = 0;
        self.latencies_histo.clear();
    }
    fn summary_since_start(&self) -> AggregatedStatsSummary {
        let elapsed = self.start.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let histo = &self.latencies_histo;
        AggregatedStatsSummary {
            elapsed_us: elapsed,
            throughput_iops: (self.op_count as f64) / elapsed_secs,
            throughput_bw_mibps: (self.op_count as f64) * (self.op_size as f64)
                / ((1 << 20) as f64)
                / elapsed_secs,
            latency_min_us: histo.min().as_f64() / 1000.0,
            latency_mean_us: histo.mean() / 1000.0,
            latency_max_us: histo.max().as_f64() / 1000.0,
            latency_percentiles: {
                let mut values = [0.0; LATENCY_PERCENTILES.len()];
                for (i, value_ref) in values.iter_mut().enumerate() {
                    *value_ref =
                        histo.value_at_percentile(LATENCY_PERCENTILES[i]).as_f64() / 1000.0;
                }
                values
            },
        }
    }
}

#[derive(serde::Serialize)]
struct BenchmarkOutput {
    args: Args,
    /// Ops per client, in client order. Equal shares mean a fair policy.
    per_client_total_ops: Vec<u64>,
    /// Max over min of `per_client_total_ops`.
    fairness_spread: f64,
    sorted_per_client_runtimes_secs: Vec<f64>,
    totals: Vec<AggregatedStatsSummary>,
}

fn monitor(
    args: Arc<Args>,
    stats_state: Arc<StatsState>,
    clients_and_monitor_ready: Arc<tokio::sync::Barrier>,
    mut stop_monitor_rx: tokio::sync::oneshot::Receiver<RunResult>,
) {
    let mut per_client_total_ops = vec![0u64; stats_state.ops_in_last_second.len()];
    let op_size = 1 << args.block_size_shift.get();
    let mut total = AggregatedStats::new(op_size);
    let mut total_summaries = Vec::new();
    let mut this_round = AggregatedStats::new(op_size);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    rt.block_on(clients_and_monitor_ready.wait());
    total.reset(std::time::Instant::now());

    let mut ticker = rt.block_on(async move { tokio::time::interval(MONITOR_PERIOD) });

    let mut exit: Option<RunResult> = None;
    while exit.is_none() {
        this_round.reset(std::time::Instant::now());
        rt.block_on(async {
            let ticker = &mut ticker;
            tokio::select! {
                _ = ticker.tick() => {}
                msg = &mut stop_monitor_rx => {
                    exit = Some(msg.unwrap());
                }
            };
        });

        for (client, counter) in stats_state.ops_in_last_second.iter().enumerate() {
            let ops = counter.swap(0, Ordering::Relaxed);
            per_client_total_ops[client] += ops;
            this_round.op_count += ops;
            total.op_count += ops;
        }
        for h in &stats_state.latencies_histo {
            let mut h = h.lock().unwrap();
            total.latencies_histo += &*h;
            this_round.latencies_histo += &*h;
            h.clear();
        }

        let this_round_summary = this_round.summary_since_start();
        let total_summary = total.summary_since_start();

        info!("{this_round_summary}");
        info!("{total_summary}");

        total_summaries.push(total_summary);
    }
    let exit = exit.unwrap();

    info!("monitor shutting down");

    let fairness_spread = match per_client_total_ops.iter().minmax().into_option() {
        Some((&min, &max)) if min > 0 => max as f64 / min as f64,
        _ => f64::INFINITY,
    };
    info!(fairness_spread, "per-client ops: {:?}", per_client_total_ops);
    let sorted_per_client_runtimes_secs = exit
        .client_run_times
        .into_iter()
        .sorted()
        .map(|d| d.as_secs_f64())
        .collect();
    let output = BenchmarkOutput {
        args: args.as_ref().clone(),
        per_client_total_ops,
        fairness_spread,
        sorted_per_client_runtimes_secs,
        totals: total_summaries,
    };
    let outpath = std::path::PathBuf::from("benchmark.output.json");
    info!("writing results to {:?}", outpath);
    std::fs::write(&outpath, serde_json::to_string(&output).unwrap()).unwrap();

    let total_summary = total.summary_since_start();
    info!("total: {}", total_summary);
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Args;

    #[test]
    fn durations_are_recorded_in_microseconds() {
        let args = Args::try_parse_from([
            "benchmark",
            "4",
            "12",
            "bfq",
            "--service-time",
            "250us",
            "--run-duration",
            "2s",
        ])
        .unwrap();
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["service_time"], 250);
        assert_eq!(json["policy"], "Bfq");
    }
}
