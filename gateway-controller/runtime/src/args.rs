use crate::{
    harness::{self, Harness},
    index::{Indexer, WatchesModel},
    k8s::{
        EndpointSlice, Gateway, GatewayClass, GatewayConfig, HttpRoute, Secret, Service,
        SERVICE_NAME_LABEL,
    },
    metrics::ReconcileMetrics,
    middleware::{wireup, HandleErrors, Measured, SharedReconciler, Traced},
    oci::{
        HttpLoadBalancerClient, MemoryLoadBalancer, OciConfig, SharedClient, WorkRequestsClient,
        WorkRequestsWatcher,
    },
    predicates::{generation_or_labels, spec_changes, updates_only},
    reconcile::{
        gateways_for_route, routes_for_gateway, Context, GatewayClassReconciler,
        GatewayReconciler, HttpRouteReconciler, LoadBalancerModel,
    },
    shutdown::ShutdownHooks,
    status::{ClientPatcher, RecordingPatcher, ResourcePatcher, StatusWriter},
};
use anyhow::{bail, Context as _, Result};
use clap::{ArgAction, Parser};
use futures::{future, prelude::*, stream::BoxStream};
use kube::runtime::{
    controller::Controller,
    reflector::{self, store::Writer, Store},
    watcher, WatchStreamExt,
};
use oke_gateway_controller_core::CONTROLLER_NAME;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "oke-gateway-controller",
    about = "Programs OCI load balancers from Gateway API resources"
)]
pub struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Runs the controllers.
    Start(Box<StartArgs>),
}

#[derive(Debug, clap::Args)]
struct StartArgs {
    #[clap(
        long,
        default_value = "oke_gateway_controller=info,warn",
        env = "APP_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain", env = "APP_LOG_FORMAT")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Builds every component and exits without starting controllers.
    #[clap(long)]
    noop: bool,

    /// The controller name GatewayClasses must reference.
    #[clap(long, default_value = CONTROLLER_NAME, env = "APP_CONTROLLER_NAME")]
    controller_name: String,

    /// Does not connect to Kubernetes. Only valid with `--noop`.
    #[clap(long, env = "APP_K8SAPI_NOOP")]
    k8s_noop: bool,

    /// Programs an in-memory load balancer instead of OCI.
    #[clap(long, env = "APP_OCIAPI_NOOP")]
    oci_noop: bool,

    /// Defaults to `~/.oci/config`.
    #[clap(long, env = "APP_OCIAPI_CONFIGFILE")]
    oci_config_file: Option<PathBuf>,

    #[clap(long, default_value = "DEFAULT", env = "APP_OCIAPI_PROFILE")]
    oci_profile: String,

    #[clap(
        long,
        default_value = "true",
        env = "APP_FEATURES_RECONCILEGATEWAYCLASS",
        action = ArgAction::Set
    )]
    reconcile_gateway_class: bool,

    #[clap(
        long,
        default_value = "true",
        env = "APP_FEATURES_RECONCILEGATEWAY",
        action = ArgAction::Set
    )]
    reconcile_gateway: bool,

    #[clap(
        long,
        default_value = "true",
        env = "APP_FEATURES_RECONCILEHTTPROUTE",
        action = ArgAction::Set
    )]
    reconcile_http_route: bool,

    #[clap(long, default_value = "2000")]
    work_request_poll_interval_ms: u64,

    #[clap(long, default_value = "1200")]
    work_request_max_poll_duration_secs: u64,

    #[clap(long, default_value = "30", env = "APP_GRACEFULSHUTDOWNTIMEOUT")]
    graceful_shutdown_timeout_secs: u64,
}

type Events<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// A reflector cache and the stream of watch events applied to it. The cache
/// is only updated while the stream is polled.
struct Cached<K: kube::Resource<DynamicType = ()> + 'static> {
    store: Store<K>,
    events: Events<K>,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Start(args) => args.run().await,
        }
    }
}

// === impl StartArgs ===

impl StartArgs {
    async fn run(self) -> Result<()> {
        if self.k8s_noop && !self.noop {
            bail!("--k8s-noop requires --noop");
        }
        if self.noop {
            return self.run_noop().await;
        }

        let mut prom = <Registry>::default();
        let metrics = ReconcileMetrics::register(&mut prom);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let load_balancer = self.load_balancer()?;
        let mut runtime = kubert::Runtime::builder()
            .with_log(self.log_level, self.log_format)
            .with_metrics(rt_metrics)
            .with_admin(self.admin.into_builder().with_prometheus(prom))
            .with_client(self.client)
            .build()
            .await?;

        // Spawn resource watches. EndpointSlices are limited to those owned by
        // Services. Secrets are not filtered by type so that listeners can
        // report references to Secrets of the wrong type.
        let classes = cached(runtime.watch_all::<GatewayClass>(watcher::Config::default()));
        let configs = cached(runtime.watch_all::<GatewayConfig>(watcher::Config::default()));
        let gateways = cached(runtime.watch_all::<Gateway>(watcher::Config::default()));
        let routes = cached(runtime.watch_all::<HttpRoute>(watcher::Config::default()));
        let secrets = cached(runtime.watch_all::<Secret>(watcher::Config::default()));
        let services = cached(runtime.watch_all::<Service>(watcher::Config::default()));
        let slices = cached(
            runtime
                .watch_all::<EndpointSlice>(watcher::Config::default().labels(SERVICE_NAME_LABEL)),
        );

        let cx = Context {
            controller_name: self.controller_name.as_str().into(),
            gateway_classes: classes.store.clone(),
            gateway_configs: configs.store.clone(),
            gateways: gateways.store.clone(),
            http_routes: routes.store.clone(),
            secrets: secrets.store.clone(),
            services: services.store.clone(),
            endpoint_slices: slices.store.clone(),
            status: StatusWriter::new(Arc::new(ClientPatcher::new(runtime.client()))),
            load_balancer,
        };

        let indexer = Indexer::new(cx.gateways.clone(), cx.http_routes.clone());
        let watches = WatchesModel::new(indexer.clone(), cx.controller_name.clone());
        watches.register_field_indexers(&indexer)?;

        let cancel = CancellationToken::new();
        let mut hooks = ShutdownHooks::default();

        // Caches that no controller consumes are driven directly.
        drive("gatewayconfigs", configs.events);
        drive("services", services.events);

        if self.reconcile_gateway_class {
            let reconciler = layered(
                "gatewayclass",
                Arc::new(GatewayClassReconciler::new(cx.clone())),
                &metrics,
            );
            let controller = Controller::for_stream(
                classes.events.applied_objects().predicate_filter(generation_or_labels),
                classes.store.clone(),
            );
            let ready = harness::ready(vec![]);
            let harness = Harness::new("gatewayclass", reconciler, ready, cancel.clone());
            spawn(&mut hooks, "gatewayclass", harness.run(controller));
        } else {
            drive("gatewayclasses", classes.events);
        }

        if self.reconcile_gateway {
            let reconciler = layered(
                "gateway",
                Arc::new(GatewayReconciler::new(cx.clone())),
                &metrics,
            );
            let mapper = watches.clone();
            // Routes are observed through a second watch so that listeners'
            // attached route counts follow routes as they come and go.
            let route_changes = spec_changes(
                runtime
                    .watch_all::<HttpRoute>(watcher::Config::default())
                    .map(Ok::<_, watcher::Error>),
            );
            let controller = Controller::for_stream(
                gateways.events.applied_objects().predicate_filter(generation_or_labels),
                gateways.store.clone(),
            )
            .watches_stream(updates_only(secrets.events), move |secret: Secret| {
                mapper.map_secret_to_gateway(&secret)
            })
            .watches_stream(route_changes, |route: HttpRoute| {
                gateways_for_route(&route)
            });
            let ready = harness::ready(vec![
                harness::store_ready(&cx.gateway_classes),
                harness::store_ready(&cx.gateway_configs),
                harness::store_ready(&cx.secrets),
                harness::store_ready(&cx.http_routes),
            ]);
            let harness = Harness::new("gateway", reconciler, ready, cancel.clone());
            spawn(&mut hooks, "gateway", harness.run(controller));
        } else {
            drive("gateways", gateways.events);
            drive("secrets", secrets.events);
        }

        if self.reconcile_http_route {
            let reconciler = layered(
                "httproute",
                Arc::new(HttpRouteReconciler::new(cx.clone())),
                &metrics,
            );
            let mapper = watches.clone();
            let route_store = cx.http_routes.clone();
            // Gateway changes are observed through a second watch so that
            // routes are recomputed when listeners change.
            let gateway_changes = runtime
                .watch_all::<Gateway>(watcher::Config::default())
                .map(Ok::<_, watcher::Error>)
                .applied_objects()
                .predicate_filter(generation_or_labels);
            let controller = Controller::for_stream(
                routes.events.applied_objects().predicate_filter(generation_or_labels),
                routes.store.clone(),
            )
            .watches_stream(slices.events.applied_objects(), move |slice: EndpointSlice| {
                mapper.map_endpoint_slice_to_http_route(&slice)
            })
            .watches_stream(gateway_changes, move |gw: Gateway| {
                routes_for_gateway(&route_store.state(), &gw)
            });
            let ready = harness::ready(vec![
                harness::store_ready(&cx.gateway_classes),
                harness::store_ready(&cx.gateway_configs),
                harness::store_ready(&cx.gateways),
                harness::store_ready(&cx.services),
                harness::store_ready(&cx.endpoint_slices),
            ]);
            let harness = Harness::new("httproute", reconciler, ready, cancel.clone());
            spawn(&mut hooks, "httproute", harness.run(controller));
        } else {
            drive("httproutes", routes.events);
            drive("endpointslices", slices.events);
        }

        // Once a shutdown signal arrives, stop the controllers and wait for
        // them while holding the drain open.
        let drain = runtime.shutdown_handle();
        let timeout = Duration::from_secs(self.graceful_shutdown_timeout_secs);
        let shutdown = tokio::spawn(async move {
            let release = drain.signaled().await;
            info!(hooks = hooks.len(), "Shutting down");
            cancel.cancel();
            let result = hooks.perform(timeout).await;
            drop(release);
            result
        });

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }
        shutdown.await.context("shutdown task failed")??;
        Ok(())
    }

    /// Builds the controllers without starting them.
    async fn run_noop(self) -> Result<()> {
        let load_balancer = self.load_balancer()?;
        self.log_format.try_init(self.log_level)?;

        let patcher: Arc<dyn ResourcePatcher> = if self.k8s_noop {
            Arc::new(RecordingPatcher::default())
        } else {
            let client = self.client.try_client().await?;
            Arc::new(ClientPatcher::new(client))
        };
        let cx = Context {
            controller_name: self.controller_name.as_str().into(),
            gateway_classes: empty_store(),
            gateway_configs: empty_store(),
            gateways: empty_store(),
            http_routes: empty_store(),
            secrets: empty_store(),
            services: empty_store(),
            endpoint_slices: empty_store(),
            status: StatusWriter::new(patcher),
            load_balancer,
        };
        let indexer = Indexer::new(cx.gateways.clone(), cx.http_routes.clone());
        WatchesModel::new(indexer.clone(), cx.controller_name.clone())
            .register_field_indexers(&indexer)?;

        let metrics = ReconcileMetrics::default();
        let controllers = [
            layered(
                "gatewayclass",
                Arc::new(GatewayClassReconciler::new(cx.clone())),
                &metrics,
            ),
            layered(
                "gateway",
                Arc::new(GatewayReconciler::new(cx.clone())),
                &metrics,
            ),
            layered(
                "httproute",
                Arc::new(HttpRouteReconciler::new(cx)),
                &metrics,
            ),
        ];
        info!(controllers = controllers.len(), "Dependencies initialized");
        Ok(())
    }

    fn load_balancer(&self) -> Result<LoadBalancerModel> {
        let oci: (SharedClient, Arc<dyn WorkRequestsClient>) = if self.oci_noop {
            let memory = MemoryLoadBalancer::new();
            (Arc::new(memory.clone()), Arc::new(memory))
        } else {
            let path = self
                .oci_config_file
                .clone()
                .unwrap_or_else(OciConfig::default_path);
            let config = OciConfig::load(&path, &self.oci_profile).with_context(|| {
                format!("failed to load OCI config {}", path.display())
            })?;
            let client = HttpLoadBalancerClient::new(&config)?;
            (Arc::new(client.clone()), Arc::new(client))
        };
        let (client, work_requests) = oci;

        let watcher = WorkRequestsWatcher::new(work_requests)
            .with_poll_interval(Duration::from_millis(self.work_request_poll_interval_ms))
            .with_max_poll_duration(Duration::from_secs(
                self.work_request_max_poll_duration_secs,
            ));
        Ok(LoadBalancerModel::new(client, watcher))
    }
}

fn layered(
    name: &'static str,
    reconciler: SharedReconciler,
    metrics: &ReconcileMetrics,
) -> SharedReconciler {
    wireup(
        reconciler,
        [
            Traced::layer(name),
            HandleErrors::layer(),
            Measured::layer(name, metrics.clone()),
        ],
    )
}

fn cached<K>(events: impl Stream<Item = watcher::Event<K>> + Send + 'static) -> Cached<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let (store, writer) = reflector::store();
    let events = reflector::reflector(writer, events.map(Ok::<_, watcher::Error>)).boxed();
    Cached { store, events }
}

fn empty_store<K>() -> Store<K>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
{
    Writer::default().as_reader()
}

/// Polls a cache's stream for as long as the process runs.
fn drive<K: Send + 'static>(name: &'static str, events: Events<K>) {
    tokio::spawn(
        events
            .for_each(|_| future::ready(()))
            .instrument(info_span!("cache", kind = name)),
    );
}

fn spawn(
    hooks: &mut ShutdownHooks,
    name: &'static str,
    controller: impl Future<Output = ()> + Send + 'static,
) {
    let task = tokio::spawn(controller.instrument(info_span!("controller", name)));
    hooks.register(name, move || async move {
        task.await.with_context(|| format!("{name} controller failed"))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> StartArgs {
        let args = Args::try_parse_from(
            ["oke-gateway-controller", "start"]
                .iter()
                .chain(args)
                .copied(),
        )
        .expect("valid arguments");
        let Command::Start(start) = args.command;
        *start
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert!(!args.noop);
        assert_eq!(args.controller_name, CONTROLLER_NAME);
        assert!(args.reconcile_gateway_class);
        assert!(args.reconcile_gateway);
        assert!(args.reconcile_http_route);
        assert_eq!(args.oci_profile, "DEFAULT");
        assert_eq!(args.work_request_poll_interval_ms, 2000);
        assert_eq!(args.work_request_max_poll_duration_secs, 1200);
        assert_eq!(args.graceful_shutdown_timeout_secs, 30);
    }

    #[test]
    fn controllers_can_be_disabled() {
        let args = parse(&["--reconcile-http-route", "false", "--noop", "--oci-noop"]);
        assert!(args.noop);
        assert!(args.oci_noop);
        assert!(args.reconcile_gateway);
        assert!(!args.reconcile_http_route);
    }

    #[test]
    fn requires_a_subcommand() {
        assert!(Args::try_parse_from(["oke-gateway-controller"]).is_err());
    }

    #[tokio::test]
    async fn noop_builds_without_clusters() {
        let args = parse(&["--noop", "--k8s-noop", "--oci-noop", "--log-level", "off"]);
        args.run().await.expect("initializes");
    }

    #[tokio::test]
    async fn k8s_noop_requires_noop() {
        let args = parse(&["--k8s-noop", "--oci-noop"]);
        args.run().await.expect_err("rejected");
    }
}
