use crate::config::PluginOptions;
use crate::dispatcher::Dispatcher;
use crate::host::{DevServerHost, HotEvent};
use crate::launcher::{LaunchOutcome, LauncherConfig, RuntimeLauncher, RuntimeProcess};
use crate::pool::ProxyAgent;
use crate::routes::RouteMatcher;
use hyper::body::Incoming;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Name the plugin registers under
pub const PLUGIN_NAME: &str = "functions-dev";

/// Dev server plugin that starts the functions runtime and routes matching
/// requests to it.
///
/// The runtime is started from [`configure_server`](Self::configure_server). If it
/// comes up, a [`Dispatcher`] is added to the host's middleware chain; if not, the
/// host keeps serving without one.
pub struct FunctionsPlugin {
    options: PluginOptions,
    runtime: Mutex<Option<RuntimeProcess>>,
}

impl FunctionsPlugin {
    pub fn new(options: PluginOptions) -> Self {
        Self {
            options,
            runtime: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    /// Whether a runtime process is currently held by the plugin
    pub fn has_runtime(&self) -> bool {
        self.runtime
            .lock()
            .as_ref()
            .is_some_and(|process| !process.has_exited())
    }

    /// Setup hook: launch the runtime and, once it is ready, register the dispatcher.
    ///
    /// Never fails the host. A failed launch is logged once and no middleware is
    /// registered, so matching requests fall through to the host's own handlers.
    pub async fn configure_server<H>(&self, host: &H) -> LaunchOutcome
    where
        H: DevServerHost + ?Sized,
    {
        let matcher = match RouteMatcher::new(self.options.match_routes.patterns()) {
            Ok(matcher) => matcher,
            Err(e) => return self.fail(format!("Invalid route pattern: {}", e)),
        };

        let config = match LauncherConfig::from_runtime(
            &self.options.runtime,
            self.options.display_runtime_logs,
        ) {
            Ok(config) => config,
            Err(e) => return self.fail(e.to_string()),
        };

        let hot = host.hot();
        let reload = self.options.reload_on_functions_changes;
        let on_restart = move || {
            if reload {
                let clients = hot.send(HotEvent::FullReload);
                debug!(clients, "Requested full reload after functions runtime restart");
            }
        };

        let launch = RuntimeLauncher::new(config).launch(on_restart).await;
        if let Some(process) = launch.process {
            if let Some(previous) = self.runtime.lock().replace(process) {
                debug!(pid = ?previous.pid(), "Replacing previous functions runtime");
            }
        }

        let url = match &launch.outcome {
            LaunchOutcome::Ready { url } => url.clone(),
            LaunchOutcome::Failed { error_message } => {
                error!(
                    plugin = PLUGIN_NAME,
                    "Functions runtime unavailable, function routes are disabled: {}",
                    error_message
                );
                return launch.outcome;
            }
        };

        let agent = match ProxyAgent::<Incoming>::new(&url, self.options.proxy.pool_config()) {
            Ok(agent) => agent,
            Err(e) => return self.fail(e.to_string()),
        };

        info!(
            plugin = PLUGIN_NAME,
            %url,
            routes = matcher.len(),
            "Forwarding matching routes to the functions runtime"
        );
        host.use_middleware(Arc::new(Dispatcher::new(matcher, &url, agent)));

        launch.outcome
    }

    /// Stop the runtime, if one is running, and wait for it to exit
    pub async fn shutdown(&self) {
        let process = self.runtime.lock().take();
        if let Some(mut process) = process {
            debug!(pid = ?process.pid(), "Shutting down functions runtime");
            process.shutdown().await;
        }
    }

    fn fail(&self, error_message: String) -> LaunchOutcome {
        error!(
            plugin = PLUGIN_NAME,
            "Functions runtime unavailable, function routes are disabled: {}",
            error_message
        );
        LaunchOutcome::Failed { error_message }
    }
}
