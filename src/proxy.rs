//! Proxy lifecycle: the per-port singleton, its handle, and the background
//! tasks it owns.
//!
//! `start()` never fails on a same-port restart: hosts reload plugins and
//! call `start()` again without closing the old instance first, so a second
//! start on an already-served port returns a delegating handle — it reports
//! the running server's wallet address (with a warning when the keys differ)
//! and its `close()` is a no-op. The real server is closed exactly once.
//!
//! `close()` stops accepting connections, cancels the background tasks
//! through a shared [`CancellationToken`], waits up to the configured grace
//! period for in-flight requests, then force-closes. The port is rebindable
//! as soon as `close()` returns.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    balance::{self, WalletEmptyFlag},
    catalog::ModelCatalog,
    config::{self, Config},
    dedup::DedupCache,
    payment::PaymentEngine,
    router::Router,
    signer::{KeySigner, PaymentSigner},
    traffic::TrafficLog,
    upstream::Forwarder,
};

/// Everything a request handler needs, shared via `Arc`.
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: ModelCatalog,
    pub router: Router,
    pub forwarder: Forwarder,
    pub payments: Arc<PaymentEngine>,
    pub dedup: DedupCache,
    pub traffic: Arc<TrafficLog>,
    pub wallet_empty: WalletEmptyFlag,
    pub wallet_address: String,
    pub started_at: std::time::Instant,
}

/// Wallet poll injected by the host. `None` results leave the previous
/// wallet-empty state alone.
pub type BalanceProbeFn =
    Box<dyn Fn() -> futures_util::future::BoxFuture<'static, Option<bool>> + Send + Sync>;

/// Options the host passes to `start()`. Environment variables override the
/// corresponding fields (`WALLET_KEY`, `PROXY_PORT`, `CLAWROUTER_DISABLED`).
pub struct ProxyOptions {
    pub config: Config,
    /// Hex private key from the host's wallet file; `WALLET_KEY` wins.
    pub wallet_key: Option<String>,
    /// Balance poll; without one the wallet is assumed funded.
    pub balance_probe: Option<BalanceProbeFn>,
}

/// Handle returned by `start()`. Cheap to clone-free pass around; `close()`
/// is idempotent and a no-op on delegated and inert handles.
pub struct ProxyHandle {
    port: u16,
    wallet_address: String,
    kind: HandleKind,
}

enum HandleKind {
    /// This handle owns the running server.
    Active(Arc<RunningProxy>),
    /// A server for this port already existed; we only point at it.
    Delegated,
    /// `CLAWROUTER_DISABLED` was set: registered but not intercepting.
    Inert,
}

impl ProxyHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self.kind, HandleKind::Delegated)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.kind, HandleKind::Active(_))
    }

    /// Shut the server down. No-op unless this handle owns it.
    pub async fn close(&self) {
        if let HandleKind::Active(running) = &self.kind {
            running.close().await;
        }
    }
}

struct RunningProxy {
    port: u16,
    wallet_address: String,
    cancel: CancellationToken,
    server: Mutex<Option<tokio::task::JoinHandle<()>>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
    grace: Duration,
}

impl RunningProxy {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(port = self.port, "proxy shutting down");
        self.cancel.cancel();

        let server = self.server.lock().expect("server handle poisoned").take();
        if let Some(mut handle) = server {
            // Graceful first; force-close the sockets after the grace period.
            if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
                warn!(port = self.port, "grace period elapsed — force-closing");
                handle.abort();
                let _ = handle.await;
            }
        }
        for task in self.background.lock().expect("background handles poisoned").drain(..) {
            task.abort();
        }
        registry().lock().expect("registry poisoned").remove(&self.port);
    }
}

/// One running proxy per port per process.
fn registry() -> &'static Mutex<HashMap<u16, Arc<RunningProxy>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u16, Arc<RunningProxy>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Start the proxy (or adopt the one already running on the port).
pub async fn start(options: ProxyOptions) -> anyhow::Result<ProxyHandle> {
    let key = config::wallet_key_from_env()
        .or(options.wallet_key)
        .ok_or_else(|| anyhow::anyhow!("no wallet key: set WALLET_KEY or pass one in"))?;
    let signer = Arc::new(KeySigner::from_hex_key(&key)?);
    start_with_signer(options.config, signer, options.balance_probe).await
}

/// Start with an externally-supplied signer (hosts with hardware wallets).
pub async fn start_with_signer(
    config: Config,
    signer: Arc<dyn PaymentSigner>,
    balance_probe: Option<BalanceProbeFn>,
) -> anyhow::Result<ProxyHandle> {
    config.validate()?;
    let catalog = ModelCatalog::new();
    catalog.validate_tiers(&config.tiers)?;

    let port = match std::env::var("PROXY_PORT") {
        Ok(value) => config::port_from_value(Some(&value)),
        Err(_) => config.proxy.port,
    };
    let wallet_address = signer.address().to_string();

    if config::disabled_from_env() {
        info!("CLAWROUTER_DISABLED is set — registering without intercepting");
        return Ok(ProxyHandle { port, wallet_address, kind: HandleKind::Inert });
    }

    // Same-port restart: delegate to the live server instead of failing.
    if let Some(existing) = registry().lock().expect("registry poisoned").get(&port) {
        if existing.wallet_address != wallet_address {
            warn!(
                port,
                running = %existing.wallet_address,
                requested = %wallet_address,
                "proxy already running with a different wallet key — delegating to it"
            );
        } else {
            info!(port, "proxy already running — returning delegating handle");
        }
        return Ok(ProxyHandle {
            port,
            wallet_address: existing.wallet_address.clone(),
            kind: HandleKind::Delegated,
        });
    }

    // Loopback only; this proxy does not terminate TLS.
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, wallet = %wallet_address, "clawrouter listening");

    let cancel = CancellationToken::new();
    let config = Arc::new(config);
    let payments = Arc::new(PaymentEngine::new(
        signer,
        config.payment.clone(),
        Duration::from_millis(config.proxy.signer_timeout_ms),
    ));
    let state = Arc::new(AppState {
        catalog: ModelCatalog::new(),
        router: Router::new(Arc::clone(&config), ModelCatalog::new()),
        forwarder: Forwarder::new(&config.proxy, Arc::clone(&payments))?,
        payments,
        dedup: DedupCache::new(config.dedup.clone()),
        traffic: Arc::new(TrafficLog::new(config.proxy.traffic_log_capacity)),
        wallet_empty: WalletEmptyFlag::new(),
        wallet_address: wallet_address.clone(),
        started_at: std::time::Instant::now(),
        config: Arc::clone(&config),
    });

    // Without an injected probe the wallet is assumed funded.
    let probe = balance_probe
        .unwrap_or_else(|| Box::new(|| Box::pin(async { None::<bool> })));
    let background = vec![
        spawn_reaper(Arc::clone(&state), cancel.clone()),
        balance::spawn_monitor(
            state.wallet_empty.clone(),
            Duration::from_millis(config.balance.poll_interval_ms),
            cancel.clone(),
            move || probe(),
        ),
    ];

    let app = crate::api::routes::router(Arc::clone(&state));
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "proxy server error");
        }
    });

    let running = Arc::new(RunningProxy {
        port,
        wallet_address: wallet_address.clone(),
        cancel,
        server: Mutex::new(Some(server)),
        background: Mutex::new(background),
        closed: AtomicBool::new(false),
        grace: Duration::from_millis(config.proxy.shutdown_grace_ms),
    });
    registry().lock().expect("registry poisoned").insert(port, Arc::clone(&running));

    Ok(ProxyHandle { port, wallet_address, kind: HandleKind::Active(running) })
}

/// Periodic sweep of the dedup and pre-auth caches.
fn spawn_reaper(state: Arc<AppState>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    state.dedup.sweep();
                    state.payments.sweep();
                }
            }
        }
    })
}
