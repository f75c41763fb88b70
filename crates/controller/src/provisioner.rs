//! Provisioning orchestrator.
//!
//! Drives a devnet from a bare spec to running nodes through five strictly
//! ordered phases: build the binary, fork a genesis, initialize node homes,
//! start the nodes, and gate on health. Each phase reports step progress to
//! the log bus; a failing step aborts the run and leaves on-disk artifacts
//! for diagnosis.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devnet_build::{BuildOutput, BuildSpec, Builder};
use devnet_genesis::{ForkOptions, ForkSource, GenesisForker};
use devnet_health::HealthChecker;
use devnet_log::{BusSink, LogBus, StepSink};
use devnet_plugin::{GenesisPatch, NetworkPlugin, PluginRegistry};
use devnet_primitives::{
    Devnet, DevnetName, DevnetSpec, Event, Namespace, Node, ProvisionLogEntry, ProvisionPhase,
    StepEvent,
};
use devnet_runtime::{Initializer, NodeContext, Runtime};
use devnet_utils::run_command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::nodes::{node_context, role_of_index, set_config_value};
use crate::store::DataDir;

/// Where provisioning events land besides the log bus.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub go_version: String,
    /// How long the health gate waits for all nodes to become ready.
    pub bootstrap_deadline: Duration,
    pub probe_interval: Duration,
    /// Self-delegation of each validator's gentx.
    pub stake_amount: String,
    /// Genesis balance funded to each validator account.
    pub account_balance: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            go_version: "1.22".to_string(),
            bootstrap_deadline: Duration::from_secs(120),
            probe_interval: devnet_health::PROBE_INTERVAL_FAST,
            stake_amount: "100000000stake".to_string(),
            account_balance: "1000000000stake".to_string(),
        }
    }
}

/// One provisioning request, derived from the devnet record by the
/// controller.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub namespace: Namespace,
    pub name: DevnetName,
    pub spec: DevnetSpec,
    /// Node indices whose homes already exist; they are kept as-is and only
    /// the missing nodes are initialized (scale-up path).
    pub existing: BTreeSet<u32>,
    /// Skips the build phase when the caller already has a binary.
    pub binary_path: Option<PathBuf>,
}

/// What a finished run reports back to the controller.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub binary: Option<BuildOutput>,
    pub binary_path: PathBuf,
    pub chain_id: String,
    pub nodes: u32,
    /// `(index, observed height)` of every node that passed the health gate.
    pub ready: Vec<(u32, u64)>,
}

impl ProvisionReport {
    pub fn ready_nodes(&self) -> u32 {
        self.ready.len() as u32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("{phase}: {message}")]
    Phase { phase: ProvisionPhase, message: String },

    #[error("provisioning cancelled")]
    Cancelled,
}

impl ProvisionError {
    fn phase(phase: ProvisionPhase, err: impl std::fmt::Display) -> Self {
        Self::Phase { phase, message: err.to_string() }
    }
}

/// The seam the controller drives provisioning through.
#[async_trait]
pub trait Provision: Send + Sync {
    async fn provision(
        &self,
        request: ProvisionRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ProvisionReport, ProvisionError>;
}

pub struct Provisioner {
    registry: PluginRegistry,
    builder: Arc<Builder>,
    forker: Arc<GenesisForker>,
    runtime: Arc<Runtime>,
    health: HealthChecker,
    bus: Arc<LogBus>,
    data_dir: DataDir,
    config: ProvisionerConfig,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: PluginRegistry,
        builder: Arc<Builder>,
        forker: Arc<GenesisForker>,
        runtime: Arc<Runtime>,
        bus: Arc<LogBus>,
        data_dir: DataDir,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            registry,
            builder,
            forker,
            runtime,
            health: HealthChecker::new(),
            bus,
            data_dir,
            config,
        }
    }

    fn chain_id(request: &ProvisionRequest) -> String {
        if request.spec.chain_id.is_empty() {
            format!("{}-devnet", request.name)
        } else {
            request.spec.chain_id.clone()
        }
    }

    /// The devnet's node set under the requested spec.
    fn desired_nodes(spec: &DevnetSpec) -> Vec<Node> {
        (0..spec.node_count())
            .map(|index| Node::new(role_of_index(spec.validators, index), index))
            .collect()
    }

    async fn build_phase(
        &self,
        plugin: &dyn NetworkPlugin,
        request: &ProvisionRequest,
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, Option<BuildOutput>), ProvisionError> {
        if let Some(path) = &request.binary_path {
            return Ok((path.clone(), None));
        }

        let build_spec = BuildSpec {
            git_ref: request.spec.sdk_version.clone(),
            go_version: self.config.go_version.clone(),
            ..Default::default()
        };

        let output =
            self.builder.build(plugin, &build_spec, sink, cancel).await.map_err(|err| {
                if err.is_cancelled() {
                    ProvisionError::Cancelled
                } else {
                    ProvisionError::phase(ProvisionPhase::Building, err)
                }
            })?;

        Ok((output.binary_path.clone(), Some(output)))
    }

    async fn fork_phase(
        &self,
        plugin: &dyn NetworkPlugin,
        request: &ProvisionRequest,
        binary_path: &std::path::Path,
        chain_id: &str,
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, ProvisionError> {
        let Some(source) = ForkSource::from_spec(&request.spec, Some(binary_path)) else {
            // No fork source set: the plugin's `init` emits a fresh genesis.
            return Ok(None);
        };

        let opts = ForkOptions {
            source,
            patch: GenesisPatch { chain_id: chain_id.to_string(), ..Default::default() },
            no_cache: false,
        };

        let forked = self.forker.fork(plugin, &opts, sink, cancel).await.map_err(|err| {
            if matches!(err, devnet_genesis::ForkError::Cancelled) {
                ProvisionError::Cancelled
            } else {
                ProvisionError::phase(ProvisionPhase::Forking, err)
            }
        })?;

        Ok(Some(forked.bytes))
    }

    /// Initializes node homes and assembles the shared genesis.
    ///
    /// Homes listed in `request.existing` survive untouched so a scale-up
    /// never re-keys running validators. Idempotent: a cancelled run can be
    /// retried and will redo only the missing homes.
    async fn init_phase(
        &self,
        plugin: &dyn NetworkPlugin,
        devnet: &Devnet,
        request: &ProvisionRequest,
        binary_path: &std::path::Path,
        forked_genesis: Option<&[u8]>,
        chain_id: &str,
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeContext>, ProvisionError> {
        let init = Initializer::new(binary_path);
        let nodes = Self::desired_nodes(&request.spec);
        let total = nodes.len() as u64;

        let mut contexts = Vec::with_capacity(nodes.len());
        let mut node_ids = Vec::with_capacity(nodes.len());

        for (done, node) in nodes.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }

            let ctx = node_context(devnet, node, plugin, &self.data_dir, binary_path);
            let name = node.name.to_string();

            sink.step(
                ProvisionPhase::Initializing,
                StepEvent::running("init")
                    .progress(done as u64, Some(total), "nodes")
                    .detail(name.clone()),
            );

            let fresh = !request.existing.contains(&node.index);
            if fresh {
                init.init_home(plugin, &ctx.home, &name, chain_id, cancel)
                    .await
                    .map_err(|err| ProvisionError::phase(ProvisionPhase::Initializing, err))?;

                if node.spec.role == devnet_primitives::NodeRole::Validator {
                    init.create_key(plugin, &ctx.home, &name, Some(node.index), cancel)
                        .await
                        .map_err(|err| ProvisionError::phase(ProvisionPhase::Initializing, err))?;
                }
            }

            let node_id = init
                .node_id(plugin, &ctx.home, cancel)
                .await
                .map_err(|err| ProvisionError::phase(ProvisionPhase::Initializing, err))?;
            node_ids.push((node_id, ctx.host.clone(), ctx.p2p_port));
            contexts.push(ctx);
        }

        match forked_genesis {
            Some(genesis) => {
                // Forked state: every node gets the patched genesis verbatim.
                for ctx in &contexts {
                    let path = plugin.config_dir(&ctx.home).join("genesis.json");
                    std::fs::write(&path, genesis)
                        .map_err(|err| ProvisionError::phase(ProvisionPhase::Initializing, err))?;
                }
            }
            None => {
                self.assemble_fresh_genesis(plugin, request, &contexts, chain_id, cancel).await?;
            }
        }

        // Wire every node to every other node.
        for (i, ctx) in contexts.iter().enumerate() {
            let peers: Vec<String> = node_ids
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, (id, host, port))| format!("{id}@{host}:{port}"))
                .collect();
            let config = plugin.config_dir(&ctx.home).join("config.toml");
            set_config_value(&config, "persistent_peers", &peers.join(","))
                .map_err(|err| ProvisionError::phase(ProvisionPhase::Initializing, err))?;
        }

        sink.step(
            ProvisionPhase::Initializing,
            StepEvent::completed("init").progress(total, Some(total), "nodes"),
        );
        Ok(contexts)
    }

    /// Fresh-genesis assembly: fund validator accounts on the first home,
    /// gentx on each validator, collect on the first home, distribute.
    async fn assemble_fresh_genesis(
        &self,
        plugin: &dyn NetworkPlugin,
        request: &ProvisionRequest,
        contexts: &[NodeContext],
        chain_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let phase = ProvisionPhase::Initializing;
        let Some(first) = contexts.first() else { return Ok(()) };
        let init = Initializer::new(&first.binary_path);

        let validators = request.spec.validators as usize;
        let validator_ctxs = &contexts[..validators.min(contexts.len())];

        // The first home is the assembly point: fund every validator account.
        for ctx in validator_ctxs {
            let key = init
                .create_key(plugin, &first.home, &format!("{}-account", ctx.node), Some(ctx.index), cancel)
                .await
                .map_err(|err| ProvisionError::phase(phase, err))?;
            if key.address.is_empty() {
                continue;
            }
            let cmd = with_binary(
                plugin.add_genesis_account_args(&first.home, &key.address, &self.config.account_balance),
                &first.binary_path,
            );
            let out = run_command(&cmd, &first.home, cancel, |_| {})
                .await
                .map_err(|err| ProvisionError::phase(phase, err))?;
            if !out.success {
                return Err(ProvisionError::phase(phase, out.stderr()));
            }
        }

        // Every validator gentxs against a copy of the funded genesis.
        let first_genesis = plugin.config_dir(&first.home).join("genesis.json");
        for ctx in validator_ctxs {
            if ctx.home != first.home {
                let dest = plugin.config_dir(&ctx.home).join("genesis.json");
                std::fs::copy(&first_genesis, &dest)
                    .map_err(|err| ProvisionError::phase(phase, err))?;
            }

            let cmd = with_binary(
                plugin.gentx_args(&ctx.home, &ctx.node, &self.config.stake_amount, chain_id),
                &first.binary_path,
            );
            let out = run_command(&cmd, &ctx.home, cancel, |_| {})
                .await
                .map_err(|err| ProvisionError::phase(phase, err))?;
            if !out.success {
                return Err(ProvisionError::phase(phase, out.stderr()));
            }

            // Collect the gentx into the assembly home.
            if ctx.home != first.home {
                let src = plugin.config_dir(&ctx.home).join("gentx");
                let dst = plugin.config_dir(&first.home).join("gentx");
                copy_dir(&src, &dst).map_err(|err| ProvisionError::phase(phase, err))?;
            }
        }

        let cmd = with_binary(plugin.collect_gentxs_args(&first.home), &first.binary_path);
        let out = run_command(&cmd, &first.home, cancel, |_| {})
            .await
            .map_err(|err| ProvisionError::phase(phase, err))?;
        if !out.success {
            return Err(ProvisionError::phase(phase, out.stderr()));
        }

        // Distribute the final genesis to every home.
        for ctx in contexts.iter().skip(1) {
            let dest = plugin.config_dir(&ctx.home).join("genesis.json");
            std::fs::copy(&first_genesis, &dest)
                .map_err(|err| ProvisionError::phase(phase, err))?;
        }
        Ok(())
    }

    async fn start_phase(
        &self,
        request: &ProvisionRequest,
        contexts: &[NodeContext],
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let runtime = self.runtime.for_mode(request.spec.mode);
        let total = contexts.len() as u64;

        // The first validator is the boot node; it comes up alone so the
        // rest have a peer to dial.
        let Some((first, rest)) = contexts.split_first() else { return Ok(()) };

        sink.step(
            ProvisionPhase::Starting,
            StepEvent::running("start").progress(0, Some(total), "nodes").detail(first.node.clone()),
        );
        runtime
            .start(first)
            .await
            .map_err(|err| ProvisionError::phase(ProvisionPhase::Starting, err))?;

        let starts = rest.iter().map(|ctx| runtime.start(ctx));
        let results = futures::future::join_all(starts).await;
        for (ctx, result) in rest.iter().zip(results) {
            result.map_err(|err| {
                ProvisionError::phase(
                    ProvisionPhase::Starting,
                    format!("{}: {err}", ctx.node),
                )
            })?;
        }

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        sink.step(
            ProvisionPhase::Starting,
            StepEvent::completed("start").progress(total, Some(total), "nodes"),
        );
        Ok(())
    }

    /// Waits until every node answers its status probe with a height, or the
    /// bootstrap deadline passes. Returns `(index, height)` of ready nodes.
    async fn health_phase(
        &self,
        contexts: &[NodeContext],
        sink: &dyn StepSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<(u32, u64)>, ProvisionError> {
        let total = contexts.len() as u64;
        let deadline = tokio::time::Instant::now() + self.config.bootstrap_deadline;

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }

            let mut ready = Vec::new();
            for ctx in contexts {
                if let devnet_health::ProbeOutcome::Responsive { height, .. } =
                    self.health.probe(&ctx.host, ctx.rpc_port).await
                {
                    if height > 0 {
                        ready.push((ctx.index, height));
                    }
                }
            }

            sink.step(
                ProvisionPhase::HealthChecking,
                StepEvent::running("ready").progress(ready.len() as u64, Some(total), "nodes"),
            );

            if ready.len() as u64 == total {
                sink.step(
                    ProvisionPhase::HealthChecking,
                    StepEvent::completed("ready").progress(total, Some(total), "nodes"),
                );
                return Ok(ready);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    target: "provisioner",
                    ready = ready.len(),
                    total,
                    "Bootstrap deadline reached.",
                );
                return Ok(ready);
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }
}

#[async_trait]
impl Provision for Provisioner {
    async fn provision(
        &self,
        request: ProvisionRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<ProvisionReport, ProvisionError> {
        let plugin = self
            .registry
            .get(&request.spec.plugin)
            .map_err(|err| ProvisionError::phase(ProvisionPhase::Building, err))?;

        let bus_key = LogBus::devnet_key(request.namespace.as_str(), request.name.as_str());
        let sink = BusSink::new(self.bus.clone(), bus_key);
        let chain_id = Self::chain_id(&request);

        info!(
            target: "provisioner",
            devnet = %request.name,
            plugin = %request.spec.plugin,
            nodes = request.spec.node_count(),
            "Provisioning devnet.",
        );

        // --- phase: building

        let (binary_path, binary) =
            self.build_phase(plugin.as_ref(), &request, &sink, &cancel).await?;
        if binary.is_some() {
            events(Event::normal("BinaryBuilt", format!("binary ready at {}", binary_path.display()), "provisioner"));
        }

        // --- phase: forking

        let forked =
            self.fork_phase(plugin.as_ref(), &request, &binary_path, &chain_id, &sink, &cancel).await?;
        if forked.is_some() {
            events(Event::normal("GenesisForked", format!("genesis forked as {chain_id}"), "provisioner"));
        }

        // --- phase: initializing

        let devnet = Devnet::new(request.namespace.clone(), request.name.clone(), request.spec.clone());
        let contexts = self
            .init_phase(
                plugin.as_ref(),
                &devnet,
                &request,
                &binary_path,
                forked.as_deref(),
                &chain_id,
                &sink,
                &cancel,
            )
            .await?;
        events(Event::normal(
            "NodesInitialized",
            format!("{} node homes initialized", contexts.len()),
            "provisioner",
        ));

        // --- phase: starting

        self.start_phase(&request, &contexts, &sink, &cancel).await?;

        // --- phase: health gate

        let ready = self.health_phase(&contexts, &sink, &cancel).await?;

        let nodes = contexts.len() as u32;
        sink.emit(ProvisionLogEntry::info(format!(
            "provisioning finished: {}/{nodes} ready",
            ready.len()
        )));

        Ok(ProvisionReport { binary, binary_path, chain_id, nodes, ready })
    }
}

fn with_binary(mut cmd: devnet_plugin::CommandSpec, binary: &std::path::Path) -> devnet_plugin::CommandSpec {
    cmd.program = binary.display().to_string();
    cmd
}

fn copy_dir(src: &std::path::Path, dst: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), dst.join(entry.file_name()))?;
        }
    }
    Ok(())
}
