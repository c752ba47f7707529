//! The proxy engine: validates configuration, owns every listener, and
//! garbage-collects listeners and sessions as they terminate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::listener::Listener;
use crate::resolver;
use crate::utils::Shutdown;

/// How often the background reaper sweeps listeners and their sessions.
///
/// Sessions and listeners normally retire themselves the moment they
/// terminate; the periodic sweep is a diagnostic safety net.
const REAP_INTERVAL: Duration = Duration::from_secs(10);

/// One expanded forwarding rule, index *i* of the four parallel
/// configuration vectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    /// Local interface to bind to, hostname or IP literal.
    pub local_host: String,
    /// Local port to bind to.
    pub local_port: u16,
    /// Remote host to forward to.
    pub remote_host: String,
    /// Remote port to forward to.
    pub remote_port: u16,
}

/// Stateful object that manages every listener of the proxy mode, with
/// graceful termination.
pub struct ProxyEngine {
    config: ProxyConfig,
    listeners: Mutex<Vec<Arc<Listener>>>,
    shutdown: Shutdown,
}

impl ProxyEngine {
    /// Create an engine for the given forwarding rules, but do not bind or
    /// listen yet.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            listeners: Mutex::new(Vec::new()),
            shutdown: Shutdown::new(),
        }
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Number of live sessions across all listeners.
    pub fn session_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .map(|listener| listener.session_count())
            .sum()
    }

    /// Send a graceful shutdown signal to the engine: stop accepting new
    /// connections and terminate each existing session.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
        for listener in self.listeners.lock().iter() {
            listener.close_sessions();
        }
    }

    /// Check the four rule vectors for equal lengths and usable ports.
    fn validate(&self) -> Result<()> {
        let lengths = [
            ("local_host", self.config.local_host.len()),
            ("local_port", self.config.local_port.len()),
            ("remote_host", self.config.remote_host.len()),
            ("remote_port", self.config.remote_port.len()),
        ];
        let max = lengths.iter().map(|&(_, len)| len).max().unwrap_or(0);
        if lengths.iter().any(|&(_, len)| len != max) {
            for (field, len) in lengths {
                if len != max {
                    error!(
                        field,
                        expected = max,
                        actual = len,
                        "configuration field has too few entries for the rule set"
                    );
                }
            }
            bail!("proxy rule vectors have mismatched lengths");
        }

        for &port in self.config.local_port.iter().chain(&self.config.remote_port) {
            if port == 0 {
                error!("port 0 is not a usable port in a forwarding rule");
                bail!("proxy rule contains port 0");
            }
        }
        for &port in &self.config.local_port {
            if port <= 1023 {
                warn!(
                    port,
                    "local port is a well-known port (<= 1023); \
                     the process may need additional privileges to bind it"
                );
            }
        }
        Ok(())
    }

    /// Expand the parallel configuration vectors into rules. Only meaningful
    /// after [`ProxyEngine::validate`] has passed.
    fn rules(&self) -> Vec<Rule> {
        let cfg = &self.config;
        (0..cfg.local_host.len())
            .map(|i| Rule {
                local_host: cfg.local_host[i].clone(),
                local_port: cfg.local_port[i],
                remote_host: cfg.remote_host[i].clone(),
                remote_port: cfg.remote_port[i],
            })
            .collect()
    }

    /// Run the engine: validate configuration, resolve endpoints, bind and
    /// arm one listener per rule, then serve until shutdown is requested or
    /// every listener has retired and its sessions have drained.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("initialized mode 'proxy'");
        self.validate()?;

        let mut accept_tasks = JoinSet::new();
        for rule in self.rules() {
            let local_ip = resolver::resolve_first(&rule.local_host)
                .await
                .with_context(|| format!("cannot resolve local_host {:?}", rule.local_host))?;
            debug!(%local_ip, local_host = %rule.local_host, "resolved local ip from local host");
            let remote_ip = resolver::resolve_first(&rule.remote_host)
                .await
                .with_context(|| format!("cannot resolve remote_host {:?}", rule.remote_host))?;
            debug!(%remote_ip, remote_host = %rule.remote_host, "resolved remote ip from remote host");

            let listener = Listener::bind(
                local_ip,
                rule.local_port,
                remote_ip,
                rule.remote_port,
                self.shutdown.clone(),
            )
            .await
            .with_context(|| {
                format!(
                    "cannot start listener using given address and port: ({}) {}:{}",
                    rule.local_host, local_ip, rule.local_port
                )
            })?;

            info!(
                listen = %listener.listen_addr(),
                remote = %listener.remote_addr(),
                "registering listener"
            );
            self.listeners.lock().push(Arc::clone(&listener));
            let handle = listener.async_listen();
            accept_tasks.spawn(async move {
                handle.await.ok();
            });
        }

        let reaper = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.reaper_loop().await })
        };

        // Serve until asked to stop, or until every accept loop has exited
        // and the remaining sessions have drained on their own.
        let drained = async {
            while accept_tasks.join_next().await.is_some() {}
            while self.session_count() > 0 {
                time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = drained => {}
        }

        self.shutdown();
        while accept_tasks.join_next().await.is_some() {}
        reaper.await.ok();
        Ok(())
    }

    async fn reaper_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = time::sleep(REAP_INTERVAL) => self.reap(),
            }
        }
    }

    /// One reaper sweep: drop finished sessions, then drop listeners that
    /// are dead and have no sessions left.
    fn reap(&self) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| {
            listener.remove_dead_sessions();
            if listener.is_dead() && listener.session_count() == 0 {
                info!(listen = %listener.listen_addr(), "removing dead listener");
                false
            } else {
                true
            }
        });
    }
}
