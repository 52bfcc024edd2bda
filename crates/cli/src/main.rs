use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, CustomResourceExt,
};
use tracing::{debug, info, warn};

use rulegate_api::{DeclaredRuleEvaluator, NotificationSink, StaticStages};
use rulegate_controller::{ChangeNotifier, ControllerConfig, ReconcileOutcome, Reconciler, RetryBackoff, CONTROLLER_NAME};
use rulegate_core::{ObjectKey, RuleSet};
use rulegate_kubehub::{rule_sets_for_pod, KubeRecorder, KubeStore};
use rulegate_store::{DelayQueue, Expectations};

#[derive(Parser, Debug)]
#[command(name = "rulegatectl", version, about = "RuleSet controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the RuleSet controller until interrupted
    Run(RunArgs),
    /// Print the RuleSet CustomResourceDefinition as YAML
    Crd,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "RULEGATE_NAMESPACE")]
    namespace: Option<String>,
    /// Comma separated stage pipeline
    #[arg(long, env = "RULEGATE_STAGES", default_value = "PreCheck,PostCheck")]
    stages: String,
    /// Maximum RuleSets reconciled at once
    #[arg(long, env = "RULEGATE_CONCURRENCY", default_value_t = 10)]
    concurrency: u16,
    #[arg(long, env = "RULEGATE_DELETION_RECHECK_SECS", default_value_t = 5)]
    deletion_recheck_secs: u64,
    #[arg(long, env = "RULEGATE_REQUEUE_BACKOFF_MS", default_value_t = 1000)]
    requeue_backoff_ms: u64,
    #[arg(long, env = "RULEGATE_ERROR_BACKOFF_SECS", default_value_t = 5)]
    error_backoff_secs: u64,
    #[arg(long, env = "RULEGATE_EXPECTATION_TTL_SECS", default_value_t = 300)]
    expectation_ttl_secs: u64,
    /// Attempts per conflicting write before the pass fails
    #[arg(long, env = "RULEGATE_RETRY_STEPS", default_value_t = 5)]
    retry_steps: u32,
}

impl RunArgs {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            deletion_recheck: Duration::from_secs(self.deletion_recheck_secs),
            requeue_backoff: Duration::from_millis(self.requeue_backoff_ms),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            concurrency: self.concurrency as usize,
            expectation_ttl: Duration::from_secs(self.expectation_ttl_secs),
            retry: RetryBackoff { steps: self.retry_steps, ..Default::default() },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("RULEGATE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RULEGATE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RULEGATE_METRICS_ADDR; expected host:port");
        }
    }
}

struct Ctx {
    reconciler: Reconciler,
}

fn action_for(out: &ReconcileOutcome, cfg: &ControllerConfig) -> Action {
    match out.requeue_after {
        Some(d) => Action::requeue(d),
        None if out.requeue => Action::requeue(cfg.requeue_backoff),
        None => Action::await_change(),
    }
}

async fn reconcile(rs: Arc<RuleSet>, ctx: Arc<Ctx>) -> Result<Action, rulegate_controller::Error> {
    let key = ObjectKey::of(rs.as_ref());
    let out = ctx.reconciler.reconcile(&key).await?;
    Ok(action_for(&out, ctx.reconciler.config()))
}

fn error_policy(rs: Arc<RuleSet>, err: &rulegate_controller::Error, ctx: Arc<Ctx>) -> Action {
    debug!(ruleset = %ObjectKey::of(rs.as_ref()), error = %err, "requeue after error");
    Action::requeue(ctx.reconciler.config().error_backoff)
}

async fn run(args: RunArgs) -> Result<()> {
    let cfg = args.config();
    let client = rulegate_kubehub::get_kube_client().await?;
    let (rule_sets, pods): (Api<RuleSet>, Api<Pod>) = match args.namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let queue = DelayQueue::new();
    let consumer = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            while let Some(key) = queue.pop().await {
                info!(pod = %key, "target outcome changed");
            }
        }
    });

    let stages = StaticStages::parse(&args.stages);
    info!(stages = ?stages.0, ns = ?args.namespace, concurrency = cfg.concurrency, "starting {}", CONTROLLER_NAME);
    let reconciler = Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(Expectations::with_ttl(cfg.expectation_ttl)),
        Arc::new(stages),
        Arc::new(DeclaredRuleEvaluator),
    )
    .with_notifier(ChangeNotifier::new(vec![Arc::clone(&queue) as Arc<dyn NotificationSink>]))
    .with_recorder(Arc::new(KubeRecorder::new(client.clone(), CONTROLLER_NAME)))
    .with_config(cfg.clone());
    let ctx = Arc::new(Ctx { reconciler });

    let controller = Controller::new(rule_sets, watcher::Config::default());
    let cache = controller.store();
    controller
        .watches(pods, watcher::Config::default(), move |pod: Pod| {
            let state = cache.state();
            rule_sets_for_pod(&pod, state.iter().map(|rs| rs.as_ref()))
        })
        .with_config(kube::runtime::controller::Config::default().concurrency(cfg.concurrency as u16))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(ruleset = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile stream error"),
            }
        })
        .await;

    info!("controller stopped; draining notifications");
    queue.shut_down();
    join_consumer(consumer).await;
    Ok(())
}

/// Wait for the notification consumer; a panic or cancellation is logged, not propagated.
async fn join_consumer(handle: tokio::task::JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "notification consumer task failed");
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Crd => print!("{}", serde_yaml::to_string(&RuleSet::crd())?),
    }
    Ok(())
}
