//! Run Orchestrator
//!
//! Validates the mode, provisions both identity slots, selects endpoints
//! and then drives the mode's pipeline of hops and exit surfaces, one
//! step at a time.
//!
//! # Usage
//!
//! ```rust,ignore
//! let tracker = TaskTracker::new();
//! let services = DefaultServices::new(opts.verify_timeout(), opts.relay.as_ref(), tracker.clone());
//! let orchestrator = Orchestrator::new(SystemBackend::new(tracker.clone()), Arc::new(services))
//!     .with_identities(Arc::new(FileIdentityStore::new(opts.peer.clone())))
//!     .with_tracker(tracker);
//!
//! let ctx = CancellationToken::new();
//! let serving = orchestrator.run(&ctx, &opts).await?;
//! // Everything started keeps running until `ctx` is cancelled
//! orchestrator.shutdown(&ctx).await;
//! ```

use crate::bridge::BridgeError;
use crate::config::{ConfigError, RunOptions, TunOptions};
use crate::device::{DeviceError, NetStack, TunnelBackend};
use crate::endpoint::{self, EndpointScanner, ResolveScanner, ScanError};
use crate::identity::{FileIdentityStore, IdentityError, IdentityProvisioner, IdentitySlot};
use crate::mode::Mode;
use crate::profile::{ProfileError, TunnelConfig};
use crate::proxy::ProxyError;
use crate::relay::RelayError;
use crate::services::HopServices;
use crate::session::{self, ProfileFiles, SessionSource, Tuning};
use crate::verify::VerifyError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Progress of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing done yet
    Init,
    /// Both identity slots provisioned
    IdentitiesReady,
    /// Endpoint candidates selected
    EndpointsReady,
    NormalPipeline,
    DoubleHopPipeline,
    RelayPipeline,
    /// Exit surface is up
    Serving,
    /// A step failed; the run is over
    Failed,
}

impl RunState {
    pub fn is_serving(&self) -> bool {
        matches!(self, RunState::Serving)
    }
}

/// Which tunnel session a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// The only hop of a normal or relay run
    Single,
    /// First hop of a double-hop run
    Outer,
    /// Second hop of a double-hop run, carried by the outer one
    Inner,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Single => write!(f, "single"),
            Hop::Outer => write!(f, "outer"),
            Hop::Inner => write!(f, "inner"),
        }
    }
}

/// What a successful run left serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Serving {
    /// Local proxy on this address
    Proxy(SocketAddr),
    /// Relay client listening publicly, upstream via a loopback proxy
    Relay { listen: SocketAddr, upstream: SocketAddr },
    /// OS-level interface with this name
    Interface(String),
}

impl fmt::Display for Serving {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Serving::Proxy(addr) => write!(f, "proxy on {}", addr),
            Serving::Relay { listen, upstream } => {
                write!(f, "relay on {} (upstream {})", listen, upstream)
            }
            Serving::Interface(name) => write!(f, "interface {}", name),
        }
    }
}

/// Run errors, each localized to the step that failed
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to provision {slot} identity: {source}")]
    Provision {
        slot: IdentitySlot,
        #[source]
        source: IdentityError,
    },

    #[error("Endpoint selection failed: {0}")]
    Selection(#[from] ScanError),

    #[error("{hop} hop: failed to build session: {source}")]
    Build {
        hop: Hop,
        #[source]
        source: ProfileError,
    },

    #[error("{hop} hop: failed to create device: {source}")]
    Device {
        hop: Hop,
        #[source]
        source: DeviceError,
    },

    #[error("{hop} hop: failed to establish tunnel: {source}")]
    Establish {
        hop: Hop,
        #[source]
        source: DeviceError,
    },

    #[error("{hop} hop: connectivity test failed: {source}")]
    Connectivity {
        hop: Hop,
        #[source]
        source: VerifyError,
    },

    #[error("{hop} hop: failed to start local proxy: {source}")]
    Proxy {
        hop: Hop,
        #[source]
        source: ProxyError,
    },

    #[error("Failed to start UDP bridge: {0}")]
    Bridge(#[source] BridgeError),

    #[error("Failed to start relay: {0}")]
    Relay(#[source] RelayError),
}

impl RunError {
    /// Hop the failure belongs to, if any
    pub fn hop(&self) -> Option<Hop> {
        match self {
            RunError::Build { hop, .. }
            | RunError::Device { hop, .. }
            | RunError::Establish { hop, .. }
            | RunError::Connectivity { hop, .. }
            | RunError::Proxy { hop, .. } => Some(*hop),
            _ => None,
        }
    }
}

/// Run orchestrator
///
/// Owns the collaborators a run needs. The backend is generic so its
/// device type stays concrete; everything else sits behind a trait object.
pub struct Orchestrator<B: TunnelBackend> {
    backend: B,
    identities: Arc<dyn IdentityProvisioner>,
    scanner: Arc<dyn EndpointScanner>,
    sessions: Arc<dyn SessionSource>,
    services: Arc<dyn HopServices>,
    state: Arc<RwLock<RunState>>,
    /// Background tasks of the backend and services
    tracker: TaskTracker,
}

impl<B: TunnelBackend> Orchestrator<B> {
    /// Create an orchestrator with file identities, resolve scanning
    /// and on-disk profiles
    pub fn new(backend: B, services: Arc<dyn HopServices>) -> Self {
        Self {
            backend,
            identities: Arc::new(FileIdentityStore::default()),
            scanner: Arc::new(ResolveScanner),
            sessions: Arc::new(ProfileFiles),
            services,
            state: Arc::new(RwLock::new(RunState::Init)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_identities(mut self, identities: Arc<dyn IdentityProvisioner>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn EndpointScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionSource>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Tracker shared with the backend and services
    pub fn with_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Cancel `ctx` and wait for every tracked task to finish
    ///
    /// Interfaces are deleted and relay clients killed before this returns.
    pub async fn shutdown(&self, ctx: &CancellationToken) {
        let was_serving = self.state().await.is_serving();
        info!(was_serving, tasks = self.tracker.len(), "shutting down");

        ctx.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        info!("shutdown complete");
    }

    /// Current run state
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    async fn set_state(&self, state: RunState) {
        *self.state.write().await = state;
    }

    /// Run one invocation
    ///
    /// Returns once the exit surface is up. Tunnels, stacks, proxies and
    /// the relay keep running as tasks of their own until `ctx` is
    /// cancelled. The first failing step ends the run.
    pub async fn run(&self, ctx: &CancellationToken, opts: &RunOptions) -> Result<Serving, RunError> {
        let result = self.drive(ctx, opts).await;

        match &result {
            Ok(serving) => {
                self.set_state(RunState::Serving).await;
                info!(%serving, "serving");
            }
            Err(e) => {
                self.set_state(RunState::Failed).await;
                error!("run failed: {}", e);
            }
        }

        result
    }

    async fn drive(&self, ctx: &CancellationToken, opts: &RunOptions) -> Result<Serving, RunError> {
        let mode = Mode::from_options(opts)?;
        info!(%mode, hops = mode.hop_count(), bind = %opts.bind, "starting run");

        for slot in IdentitySlot::ALL {
            self.identities
                .provision(&slot.dir(&opts.storage_dir), &opts.license)
                .await
                .map_err(|source| RunError::Provision { slot, source })?;
        }
        self.set_state(RunState::IdentitiesReady).await;

        let endpoints =
            endpoint::select_endpoints(ctx, &opts.endpoint, opts.scan.as_ref(), self.scanner.as_ref()).await?;
        self.set_state(RunState::EndpointsReady).await;
        info!(?endpoints, "endpoints selected");

        let storage = opts.storage_dir.as_path();
        match mode {
            Mode::Normal { tun } => {
                self.set_state(RunState::NormalPipeline).await;
                self.run_normal(ctx, storage, &endpoints[0], tun, opts.bind).await
            }
            Mode::DoubleHop { tun } => {
                self.set_state(RunState::DoubleHopPipeline).await;
                self.run_double_hop(ctx, storage, &endpoints[0], tun, opts.bind).await
            }
            Mode::Relay { country } => {
                self.set_state(RunState::RelayPipeline).await;
                self.run_relay(ctx, storage, &endpoints[0], &country, opts.bind).await
            }
        }
    }

    async fn run_normal(
        &self,
        ctx: &CancellationToken,
        storage: &Path,
        endpoint: &str,
        tun: Option<TunOptions>,
        bind: SocketAddr,
    ) -> Result<Serving, RunError> {
        let config = self.build(Hop::Single, IdentitySlot::Primary, storage, endpoint, Tuning::Outer).await?;
        self.expose(ctx, Hop::Single, &config, tun, bind).await
    }

    async fn run_double_hop(
        &self,
        ctx: &CancellationToken,
        storage: &Path,
        endpoint: &str,
        tun: Option<TunOptions>,
        bind: SocketAddr,
    ) -> Result<Serving, RunError> {
        let outer = self.build(Hop::Outer, IdentitySlot::Primary, storage, endpoint, Tuning::Outer).await?;
        let outer_stack = self.userspace_hop(ctx, Hop::Outer, &outer).await?;

        let bridge = self.services
            .start_bridge(
                ctx,
                SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
                endpoint,
                outer_stack,
                Tuning::Outer.mtu(),
            )
            .await
            .map_err(RunError::Bridge)?;

        let inner = self.build(
            Hop::Inner,
            IdentitySlot::Secondary,
            storage,
            &bridge.to_string(),
            Tuning::Inner,
        )
        .await?;
        self.expose(ctx, Hop::Inner, &inner, tun, bind).await
    }

    async fn run_relay(
        &self,
        ctx: &CancellationToken,
        storage: &Path,
        endpoint: &str,
        country: &str,
        bind: SocketAddr,
    ) -> Result<Serving, RunError> {
        let config = self.build(Hop::Single, IdentitySlot::Primary, storage, endpoint, Tuning::Outer).await?;
        let stack = self.userspace_hop(ctx, Hop::Single, &config).await?;

        let upstream = self.services
            .start_local_proxy(ctx, stack, SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(|source| RunError::Proxy { hop: Hop::Single, source })?;

        self.services
            .start_relay(ctx, upstream, bind, country)
            .await
            .map_err(RunError::Relay)?;

        Ok(Serving::Relay { listen: bind, upstream })
    }

    /// Load and tune the session for one hop
    async fn build(
        &self,
        hop: Hop,
        slot: IdentitySlot,
        storage: &Path,
        endpoint: &str,
        tuning: Tuning,
    ) -> Result<TunnelConfig, RunError> {
        session::build_session(self.sessions.as_ref(), &slot.profile_path(storage), endpoint, tuning)
            .await
            .map_err(|source| RunError::Build { hop, source })
    }

    /// Bring `config` up on a userspace stack and prove traffic flows
    async fn userspace_hop(
        &self,
        ctx: &CancellationToken,
        hop: Hop,
        config: &TunnelConfig,
    ) -> Result<Arc<dyn NetStack>, RunError> {
        let (device, stack) = self.backend
            .create_userspace_stack(config)
            .await
            .map_err(|source| RunError::Device { hop, source })?;

        let name = self.backend.device_name(&device);
        self.backend
            .establish(ctx, config, device, 0)
            .await
            .map_err(|source| RunError::Establish { hop, source })?;
        info!(%hop, device = %name, mtu = config.interface.mtu, "tunnel established");

        self.services
            .verify_connectivity(ctx, stack.clone())
            .await
            .map_err(|source| RunError::Connectivity { hop, source })?;
        info!(%hop, stack = %stack.label(), "connectivity verified");

        Ok(stack)
    }

    /// Final hop: either an OS interface, or a verified stack behind a proxy
    async fn expose(
        &self,
        ctx: &CancellationToken,
        hop: Hop,
        config: &TunnelConfig,
        tun: Option<TunOptions>,
        bind: SocketAddr,
    ) -> Result<Serving, RunError> {
        if let Some(tun) = tun {
            let device = self.backend
                .create_os_interface()
                .await
                .map_err(|source| RunError::Device { hop, source })?;

            let name = self.backend.device_name(&device);
            self.backend
                .establish(ctx, config, device, tun.fwmark)
                .await
                .map_err(|source| RunError::Establish { hop, source })?;
            info!(%hop, interface = %name, fwmark = tun.fwmark, "interface established");

            return Ok(Serving::Interface(name));
        }

        let stack = self.userspace_hop(ctx, hop, config).await?;
        let addr = self.services
            .start_local_proxy(ctx, stack, bind)
            .await
            .map_err(|source| RunError::Proxy { hop, source })?;

        Ok(Serving::Proxy(addr))
    }
}
