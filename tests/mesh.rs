use std::thread;

use meshinfer::{
    node::{
        coordinator::{Coordinator, InferencePass},
        kernel::DotProductKernel,
        net::{wire::RESERVED_BYTES, Mesh},
        provision::{Model, ModelPlan},
        storage::MemStorage,
        topology::Topology,
    },
    Error, Node, NodeConfig,
};

const COORDINATOR: u8 = 0;

struct Settings {
    stack_size: usize,
    payload: usize,
}

fn plan(workers: Vec<u8>) -> ModelPlan {
    ModelPlan::builder()
        .workers(workers)
        .widths(vec![24, 24, 24, 24, 24, 16])
        .input_width(20)
        .classifier_width(9)
        .classifier_segment(2)
        .residual_every(2)
        .seed(11)
        .build()
}

fn node_config(id: u8, settings: &Settings, plan: &ModelPlan) -> NodeConfig {
    NodeConfig::builder()
        .node_id(id)
        .coordinator_id(COORDINATOR)
        .message_size(RESERVED_BYTES + settings.payload)
        .stack_size(settings.stack_size)
        .classifier_segment(plan.classifier_segment)
        .build()
}

/// Runs one pass over an in-process mesh and returns it with every worker's
/// storage.
fn run_mesh(model: &Model, settings: &Settings, input: &[u8]) -> (InferencePass, Vec<MemStorage>) {
    let plan = &model.plan;
    let mut ids = vec![COORDINATOR];
    ids.extend(&plan.workers);
    let mut mesh = Mesh::build(&ids, COORDINATOR);

    let mut storages = Vec::new();
    let mut handles = Vec::new();
    for worker in &model.workers {
        let config = node_config(worker.id, settings, plan);
        let storage = MemStorage::new();
        worker.install(&storage, &config).unwrap();
        storages.push(storage.clone());
        let transport = mesh.remove(&worker.id).unwrap();
        handles.push(thread::spawn(move || {
            let topology = Topology::load(&storage, &config.topology_file)?;
            let kernel = DotProductKernel::new(&topology);
            Node::new(config, topology, transport, storage, kernel)?.run()
        }));
    }

    let mut coordinator = Coordinator::new(
        &node_config(COORDINATOR, settings, plan),
        plan.workers.clone(),
        plan.terminal_layer(),
        mesh.remove(&COORDINATOR).unwrap(),
    )
    .unwrap();
    let pass = coordinator
        .run(&model.inputs(input), &plan.classifier_lengths())
        .unwrap();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    (pass, storages)
}

#[test]
fn mesh_matches_single_node_evaluation() {
    let model = plan(vec![1, 2, 3]).build().unwrap();
    let input = model.plan.random_input();
    let settings = Settings {
        stack_size: 1024,
        payload: 16,
    };
    let (pass, _) = run_mesh(&model, &settings, &input);
    let reference = model.evaluate(&input).unwrap();
    assert_eq!(pass, reference);
    assert_eq!(pass.pooled.len(), 16);
    assert_eq!(pass.logits().len(), 9);
}

#[test]
fn spilling_is_invisible_to_receivers() {
    let model = plan(vec![1, 2]).build().unwrap();
    let input = model.plan.random_input();

    let (on_chip, storages) = run_mesh(
        &model,
        &Settings {
            stack_size: 1024,
            payload: 8,
        },
        &input,
    );
    assert!(storages.iter().all(|s| !s.contains("overflow.bin")));

    let (spilled, storages) = run_mesh(
        &model,
        &Settings {
            stack_size: 5,
            payload: 8,
        },
        &input,
    );
    assert!(storages.iter().all(|s| s.contains("overflow.bin")));
    assert_eq!(on_chip, spilled);
}

#[test]
fn tiny_frames_and_one_worker_agree() {
    let model = plan(vec![7]).build().unwrap();
    let input = model.plan.random_input();
    let (pass, _) = run_mesh(
        &model,
        &Settings {
            stack_size: 3,
            payload: 1,
        },
        &input,
    );
    assert_eq!(pass, model.evaluate(&input).unwrap());
}

#[test]
fn passes_are_deterministic() {
    let model = plan(vec![1, 2, 3, 4]).build().unwrap();
    let input = model.plan.random_input();
    let settings = Settings {
        stack_size: 4,
        payload: 5,
    };
    let (first, _) = run_mesh(&model, &settings, &input);
    let (second, _) = run_mesh(&model, &settings, &input);
    assert_eq!(first, second);
}

#[test]
fn stop_halts_waiting_workers() {
    let model = plan(vec![1, 2]).build().unwrap();
    let settings = Settings {
        stack_size: 1024,
        payload: 8,
    };
    let plan = &model.plan;
    let mut mesh = Mesh::build(&[COORDINATOR, 1, 2], COORDINATOR);

    let handles: Vec<_> = model
        .workers
        .iter()
        .map(|worker| {
            let config = node_config(worker.id, &settings, plan);
            let storage = MemStorage::new();
            worker.install(&storage, &config).unwrap();
            let topology = worker.topology.clone();
            let transport = mesh.remove(&worker.id).unwrap();
            thread::spawn(move || {
                let kernel = DotProductKernel::new(&topology);
                Node::new(config, topology, transport, storage, kernel)?.run()
            })
        })
        .collect();

    let mut coordinator = Coordinator::new(
        &node_config(COORDINATOR, &settings, plan),
        plan.workers.clone(),
        plan.terminal_layer(),
        mesh.remove(&COORDINATOR).unwrap(),
    )
    .unwrap();
    coordinator.stop_all().unwrap();

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err.root(), Error::Stopped));
    }
}
