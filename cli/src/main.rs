use std::{path::PathBuf, time::Duration};

use clap::Parser;
use hashbrown::HashMap;
use meshinfer::node::{
    config::{
        NodeConfig, NodeId, LINEAR_SEGMENT, MESSAGE_SIZE, STACK_SIZE, TOPOLOGY_FILE, WEIGHTS_FILE,
    },
    coordinator::{Coordinator, InferencePass},
    kernel::DotProductKernel,
    loader::WeightStream,
    mapping,
    net::{MemoryTransport, Mesh},
    observe::{MemorySampler, Profiler},
    provision::{ModelPlan, WorkerModel},
    storage::{DirStorage, MemStorage, Storage},
    topology::{LayerKind, Topology, LAYER_COUNT},
};
use meshinfer::Node;
use tokio::task::JoinSet;
use tracing::{error, info};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const COORDINATOR: NodeId = 0;

#[derive(Parser)]
#[command(
    name = "meshinfer",
    about = "Run a quantized network partitioned across a mesh of small nodes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Provision a synthetic model and run one pass on an in-process mesh
    Simulate(SimulateArgs),
    /// Print a provisioned node's layer table and weight census
    Inspect {
        /// Directory the model was provisioned into
        #[arg(long)]
        data_dir: PathBuf,
        /// Node to inspect
        #[arg(long)]
        node: NodeId,
    },
}

#[derive(clap::Args)]
struct SimulateArgs {
    /// Worker nodes; ids run from 1
    #[arg(long, default_value = "4")]
    workers: u8,
    /// Layers including the pooling and classifier layers
    #[arg(long, default_value_t = LAYER_COUNT)]
    layers: usize,
    /// Output width of every hidden layer
    #[arg(long, default_value = "96")]
    width: usize,
    #[arg(long, default_value = "64")]
    input_width: usize,
    /// Classifier outputs
    #[arg(long, default_value = "10")]
    classes: usize,
    #[arg(long, default_value_t = MESSAGE_SIZE)]
    message_size: usize,
    /// On-chip result capacity; anything larger spills to storage
    #[arg(long, default_value_t = STACK_SIZE)]
    stack_size: usize,
    #[arg(long, default_value_t = LINEAR_SEGMENT)]
    segment: usize,
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Provision node files here instead of in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Print per-layer timings and memory peaks
    #[arg(long)]
    profile: bool,
    /// Memory sampling period in milliseconds, 0 to disable
    #[arg(long, default_value = "1")]
    sample_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Simulate(args) => simulate(args).await,
        Commands::Inspect { data_dir, node } => inspect(data_dir, node),
    };
    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}

type WorkerOutcome = meshinfer::Result<(NodeId, Profiler)>;

async fn simulate(args: SimulateArgs) -> CliResult<()> {
    if args.layers < 2 {
        return Err("a network needs at least a pooling and a classifier layer".into());
    }
    let workers: Vec<NodeId> = (1..=args.workers).collect();
    let plan = ModelPlan::builder()
        .workers(workers.clone())
        .widths(vec![args.width; args.layers - 1])
        .input_width(args.input_width)
        .classifier_width(args.classes)
        .classifier_segment(args.segment)
        .seed(args.seed)
        .build();
    let model = plan.build()?;
    info!(
        "provisioned {} layers for {} workers (terminal layer {})",
        plan.layer_count(),
        workers.len(),
        plan.terminal_layer()
    );

    let mut ids = vec![COORDINATOR];
    ids.extend(&workers);
    let mut mesh = Mesh::build(&ids, COORDINATOR);
    let sample_period = (args.sample_ms > 0).then(|| Duration::from_millis(args.sample_ms));

    let mut tasks: JoinSet<WorkerOutcome> = JoinSet::new();
    let mut samplers = HashMap::new();
    for worker in &model.workers {
        let config = NodeConfig::builder()
            .node_id(worker.id)
            .coordinator_id(COORDINATOR)
            .message_size(args.message_size)
            .stack_size(args.stack_size)
            .classifier_segment(args.segment)
            .build();
        let transport = mesh
            .remove(&worker.id)
            .ok_or("worker missing from the mesh")?;
        let sampler = match &args.data_dir {
            Some(dir) => {
                let storage = DirStorage::new(dir.join(format!("node-{}", worker.id)))?;
                spawn_worker(&mut tasks, worker, config, storage, transport, sample_period)?
            }
            None => spawn_worker(
                &mut tasks,
                worker,
                config,
                MemStorage::new(),
                transport,
                sample_period,
            )?,
        };
        if let Some(sampler) = sampler {
            samplers.insert(worker.id, sampler);
        }
    }

    let coordinator_config = NodeConfig::builder()
        .node_id(COORDINATOR)
        .coordinator_id(COORDINATOR)
        .message_size(args.message_size)
        .build();
    let transport = mesh
        .remove(&COORDINATOR)
        .ok_or("coordinator missing from the mesh")?;
    let mut coordinator =
        Coordinator::new(&coordinator_config, workers.clone(), plan.terminal_layer(), transport)?;
    let input = plan.random_input();
    let inputs = model.inputs(&input);
    let lengths = plan.classifier_lengths();
    let mut pass = tokio::task::spawn_blocking(move || coordinator.run(&inputs, &lengths));

    // A failed worker leaves the coordinator waiting forever, so watch both.
    let mut profiles = Vec::new();
    let pass: InferencePass = loop {
        tokio::select! {
            done = &mut pass => break done??,
            Some(done) = tasks.join_next() => profiles.push(done??),
        }
    };
    while let Some(done) = tasks.join_next().await {
        profiles.push(done??);
    }
    profiles.sort_by_key(|(id, _)| *id);

    println!("pooled vector: {} bytes", pass.pooled.len());
    for (id, result) in &pass.results {
        println!("node {:>3}: {:?}", id, result);
    }
    let reference = model.evaluate(&input)?;
    println!(
        "matches single-node evaluation: {}",
        if reference == pass { "yes" } else { "NO" }
    );

    if args.profile {
        for (id, profiler) in &profiles {
            print_profile(*id, profiler);
        }
    }
    let mut samplers: Vec<_> = samplers.into_iter().collect();
    samplers.sort_by_key(|(id, _)| *id);
    for (id, sampler) in samplers {
        let samples = sampler.stop();
        let peak = samples.iter().copied().max().unwrap_or(0);
        println!(
            "node {:>3}: {} memory samples, peak {} bytes",
            id,
            samples.len(),
            peak
        );
    }
    Ok(())
}

/// Provisions one worker, builds its node and starts it on a blocking
/// thread.
fn spawn_worker<S>(
    tasks: &mut JoinSet<WorkerOutcome>,
    worker: &WorkerModel,
    config: NodeConfig,
    storage: S,
    transport: MemoryTransport,
    sample_period: Option<Duration>,
) -> CliResult<Option<MemorySampler>>
where
    S: Storage + Send + 'static,
    S::Reader: Send,
{
    worker.install(&storage, &config)?;
    let topology = Topology::load(&storage, &config.topology_file)?;
    let kernel = DotProductKernel::new(&topology);
    let node = Node::new(config, topology, transport, storage, kernel)?;
    let sampler = sample_period.map(|period| MemorySampler::start(node.gauge().clone(), period));
    let profiler = Profiler::new(node.gauge().clone());
    let mut node = node.with_observer(profiler);
    let id = worker.id;
    tasks.spawn_blocking(move || {
        node.run()?;
        Ok((id, node.into_observer()))
    });
    Ok(sampler)
}

fn print_profile(id: NodeId, profiler: &Profiler) {
    println!("node {}:", id);
    println!("  layer  elapsed      waited       peak bytes");
    for layer in profiler.layers() {
        println!(
            "  {:>5}  {:>10.3?}  {:>10.3?}  {:>10}",
            layer.layer, layer.elapsed, layer.waited, layer.peak_memory
        );
    }
    if let Some(total) = profiler.total() {
        println!(
            "  total {:.3?}, {:.3?} of it waiting",
            total,
            profiler.total_wait()
        );
    }
}

fn inspect(data_dir: PathBuf, node: NodeId) -> CliResult<()> {
    let storage = DirStorage::new(data_dir.join(format!("node-{}", node)))?;
    let topology = Topology::load(&storage, TOPOLOGY_FILE)?;
    println!(
        "node {}: {} layers, terminal layer {}",
        node,
        topology.len(),
        topology.terminal_layer()
    );

    let mut stream = WeightStream::new(WEIGHTS_FILE);
    for (j, layer) in topology.layers.iter().enumerate() {
        let kind = topology.kind(j);
        let start = stream.cursor();
        let mut blocks = 0;
        let mut entries = 0;
        loop {
            let block = stream.next_block(&storage, j)?;
            blocks += 1;
            entries += block.entries.len();
            if kind != LayerKind::Classifier || block.last {
                break;
            }
        }
        println!(
            "layer {:>3} {:<10} in {:>6} out {:>6} zp {:>3} weights {:>8}..{:<8} \
             {} block(s), {} entries{}",
            j,
            format!("{:?}", kind),
            layer.input_length,
            layer.result_length,
            layer.quant.zero_point,
            start,
            stream.cursor(),
            blocks,
            entries,
            layer
                .residual_source
                .map(|s| format!(", residual from {}", s))
                .unwrap_or_default()
        );
        if j > 0 {
            for group in mapping::resolve(&topology, j)?.groups {
                println!(
                    "    layer {} output -> {:?}: {} elements, padding at {:?}",
                    j - 1,
                    group.destinations,
                    group.count,
                    group.padding
                );
            }
        }
    }
    Ok(())
}
