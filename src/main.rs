// tm-sim: drive one TM system with synthetic traffic.
//
// A generator thread produces packets for a small two-class hierarchy, a pinned
// scheduling thread owns the TmSystem (admission plus dispatch), and a drain
// thread consumes the egress channel. The run stops on Ctrl+C or after the
// requested duration and prints the system snapshot as JSON.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_scheduler::threading::{pin_current_thread, set_thread_class, ThreadClass};
use tm_scheduler::{
    Packet, Parent, Percent, Priority, SchedParams, ShaperParams, ThresholdParams, TmConfig,
    TmContext, TmQueueId, TmRequirements, TmSnapshot, TmSystem, WredCurve, WredParams,
};
use tracing::{info, warn};

/// Command-line options parsed from program arguments.
struct CliOptions {
    duration: Duration,
    /// Leaf queues per traffic class.
    queues_per_class: u32,
    /// Shaped rate of the whole port, in units of 1000 bytes/second.
    port_rate: u32,
    pkt_len: u32,
    /// Packets offered per millisecond across all queues.
    offered_per_ms: u32,
    core: Option<usize>,
    config: Option<String>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            queues_per_class: 4,
            port_rate: 10_000,
            pkt_len: 1_000,
            offered_per_ms: 20,
            core: None,
            config: None,
        }
    }
}

/// Parse `--key=value` or `--key value` arguments; unknown keys are ignored.
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), args.next()),
        };
        let Some(value) = value else {
            continue;
        };
        match key.as_str() {
            "--duration-ms" => {
                if let Ok(ms) = value.parse() {
                    options.duration = Duration::from_millis(ms);
                }
            }
            "--queues" => options.queues_per_class = value.parse().unwrap_or(options.queues_per_class),
            "--port-rate" => options.port_rate = value.parse().unwrap_or(options.port_rate),
            "--pkt-len" => options.pkt_len = value.parse().unwrap_or(options.pkt_len),
            "--offered-per-ms" => {
                options.offered_per_ms = value.parse().unwrap_or(options.offered_per_ms)
            }
            "--core" => options.core = value.parse().ok(),
            "--config" => options.config = Some(value),
            _ => warn!(%key, "unknown option"),
        }
    }
    options
}

struct Topology {
    system: TmSystem<Packet>,
    queues: Vec<TmQueueId>,
}

/// One level-0 port node shaped to `port_rate`, two level-1 class nodes
/// (realtime in class 0, bulk in class 1 with weight-based sharing), and
/// `queues_per_class` leaves under each.
fn build_topology(ctx: &TmContext, options: &CliOptions) -> Result<Topology, Box<dyn std::error::Error>> {
    let queues_per_class = options.queues_per_class.max(1);
    let requirements = TmRequirements {
        max_tm_queues: queues_per_class * 2,
        max_tm_nodes: 3,
        max_timers: queues_per_class * 2 + 3,
        ..TmRequirements::default()
    };
    let mut system = ctx.create_system::<Packet>(Some("sim"), requirements)?;
    let profiles = ctx.profiles().clone();

    let port_shaper = profiles.create(
        Some("port"),
        ShaperParams::single_rate(options.port_rate, options.pkt_len * 8),
    )?;
    let threshold = profiles.create(
        Some("leaf-limit"),
        ThresholdParams {
            max_pkts: Some(512),
            max_bytes: None,
        },
    )?;
    let mut wred = WredParams::uniform(WredCurve {
        enabled: true,
        min_threshold: Percent::from_whole(50)?,
        med_threshold: Percent::from_whole(80)?,
        med_drop_prob: Percent::from_whole(10)?,
        max_drop_prob: Percent::from_whole(50)?,
    });
    wred.mark_ecn = true;
    let wred = profiles.create(Some("leaf-wred"), wred)?;

    let port = system.create_node(Some("port"), 0, Priority::HIGHEST)?;
    system.connect_node(port, Parent::Output(0))?;
    system.set_node_shaper(port, Some(port_shaper))?;

    let realtime = system.create_node(Some("realtime"), 1, Priority::HIGHEST)?;
    let bulk = system.create_node(Some("bulk"), 1, Priority::new(1)?)?;
    system.connect_node(realtime, Parent::Node(port))?;
    system.connect_node(bulk, Parent::Node(port))?;

    let mut queues = Vec::new();
    for (class, parent) in [("rt", realtime), ("bulk", bulk)] {
        for index in 0..queues_per_class {
            let name = format!("{class}-{index}");
            let queue = system.create_queue(Some(&name), Priority::HIGHEST)?;
            // Bulk leaves get weights 1, 2, 3, ... so their shares differ.
            let weight = if class == "bulk" { (index % 255 + 1) as u8 } else { 1 };
            let sched = profiles.create(None, SchedParams::uniform(weight))?;
            system.set_queue_sched(queue, Some(sched))?;
            system.set_queue_threshold(queue, Some(threshold))?;
            system.set_queue_wred(queue, Some(wred))?;
            system.connect_queue(queue, Parent::Node(parent))?;
            queues.push(queue);
        }
    }
    Ok(Topology { system, queues })
}

/// What the egress side observed.
#[derive(Debug, Default)]
struct EgressStats {
    pkts: u64,
    bytes: u64,
    marked: u64,
    total_latency: Duration,
    max_latency: Duration,
}

impl EgressStats {
    fn record(&mut self, pkt: &Packet) {
        let latency = pkt.latency();
        self.pkts += 1;
        self.bytes += pkt.len as u64;
        self.marked += pkt.ecn_marked as u64;
        self.total_latency += latency;
        self.max_latency = self.max_latency.max(latency);
    }

    fn mean_latency(&self) -> Duration {
        match self.pkts {
            0 => Duration::ZERO,
            pkts => Duration::from_nanos((self.total_latency.as_nanos() / pkts as u128) as u64),
        }
    }
}

/// Offer `offered_per_ms` packets every millisecond, spread round-robin over
/// the leaf queues, until `running` clears.
fn generate(
    tx: Sender<(usize, Packet)>,
    queue_count: usize,
    offered_per_ms: u32,
    pkt_len: u32,
    running: Arc<AtomicBool>,
) {
    let mut next = 0usize;
    let mut flow = 0u64;
    while running.load(Ordering::Relaxed) {
        for _ in 0..offered_per_ms {
            // Half the flows are ECN capable so WRED marks some and drops others.
            let pkt = match flow % 2 {
                0 => Packet::new(flow, pkt_len).ecn_capable(),
                _ => Packet::new(flow, pkt_len),
            };
            flow = flow.wrapping_add(1);
            if tx.try_send((next, pkt)).is_err() {
                break;
            }
            next = (next + 1) % queue_count;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Own the system: admit generated packets and dispatch on wall-clock time.
fn schedule(
    mut topology: Topology,
    rx: Receiver<(usize, Packet)>,
    running: Arc<AtomicBool>,
    core: Option<usize>,
) -> TmSnapshot {
    if let Some(core) = core {
        if let Err(err) = pin_current_thread(core) {
            warn!(core, %err, "could not pin scheduling thread");
        }
        if let Err(err) = set_thread_class(ThreadClass::Fifo) {
            warn!(%err, "could not raise scheduling thread priority");
        }
    }

    let start = Instant::now();
    while running.load(Ordering::Relaxed) {
        loop {
            match rx.try_recv() {
                Ok((index, pkt)) => {
                    let queue = topology.queues[index];
                    if let Err(err) = topology.system.enqueue(queue, pkt) {
                        warn!(%queue, %err, "enqueue failed");
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
        // One cycle is one nanosecond.
        let now = start.elapsed().as_nanos() as u64;
        if topology.system.run(now, 64) == 0 {
            std::thread::yield_now();
        }
    }
    topology.system.snapshot()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let options = parse_cli_options();

    let config = match &options.config {
        Some(path) => TmConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => TmConfig::default(),
    };
    let ctx = TmContext::new(config)?;
    let mut topology = build_topology(&ctx, &options)?;

    let (egress_tx, egress_rx) = bounded::<Packet>(4_096);
    topology.system.set_output(0, egress_tx)?;
    let (ingress_tx, ingress_rx) = bounded(16_384);

    let running = Arc::new(AtomicBool::new(true));
    let running_for_signal = running.clone();
    ctrlc::set_handler(move || {
        running_for_signal.store(false, Ordering::Relaxed);
    })?;

    let queue_count = topology.queues.len();
    let generator = {
        let running = running.clone();
        let (offered, len) = (options.offered_per_ms, options.pkt_len);
        std::thread::Builder::new()
            .name("tm-generator".into())
            .spawn(move || generate(ingress_tx, queue_count, offered, len, running))?
    };
    let drain = std::thread::Builder::new()
        .name("tm-egress".into())
        .spawn(move || {
            let mut stats = EgressStats::default();
            for pkt in egress_rx {
                stats.record(&pkt);
            }
            stats
        })?;
    let scheduler = {
        let running = running.clone();
        let core = options.core;
        std::thread::Builder::new()
            .name("tm-scheduler".into())
            .spawn(move || schedule(topology, ingress_rx, running, core))?
    };

    info!(duration = ?options.duration, queues = queue_count, "simulation started");
    let deadline = Instant::now() + options.duration;
    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    running.store(false, Ordering::Relaxed);

    if generator.join().is_err() {
        warn!("generator thread panicked");
    }
    let snapshot = scheduler
        .join()
        .map_err(|_| "scheduling thread panicked")?;
    // The system, and with it the egress sender, was dropped with the thread.
    let egress = drain.join().map_err(|_| "egress thread panicked")?;
    info!(
        pkts = egress.pkts,
        bytes = egress.bytes,
        marked = egress.marked,
        mean_latency = ?egress.mean_latency(),
        max_latency = ?egress.max_latency,
        "egress drained"
    );

    println!("{}", snapshot.to_json()?);
    Ok(())
}
