use anyhow::Result;
use clap::Parser;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use identity_core::{HostResolver, ProxyConfig};
use identity_proxy::{
    ErrorHook, KeyManager, LoggingMiddleware, MiddlewareChain, RequestForwarder, RetryPolicy,
    RewritingProxy, SessionChecker, SessionJwtBridge, WelcomeRedirectMiddleware,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::process::Command as ProcessCommand;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

mod cli;
mod errors;

use cli::{Cli, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.common().log_format);

    info!("Starting identity-gateway...");

    let config = Arc::new(cli.into_config()?);
    info!("Mode: {:?}", config.mode);
    info!("  - Application: {}", config.upstream);
    info!("  - Identity service: {}", config.identity_service_url);
    info!("  - Public URL: {}", config.public_url);
    info!("  - Cookie domain: {}", config.cookie_domain);
    if !config.path_prefix.is_empty() {
        info!("  - Identity path prefix: {}", config.path_prefix);
    }

    // Signing key lives for the whole process
    let keys = KeyManager::new(config.no_jwt)?.keys();

    let middleware = Arc::new(build_middleware(&config));
    info!("Middleware chain initialized with {} middleware(s)", middleware.len());

    let on_error: ErrorHook = Arc::new(errors::error_response);

    let forwarder = RequestForwarder::new(config.upstream_timeout)?;
    info!(
        "Request forwarder initialized with {}s timeout",
        config.upstream_timeout.as_secs()
    );

    let proxy = Arc::new(RewritingProxy::new(
        HostResolver::new(Arc::clone(&config)),
        forwarder,
        middleware,
        Arc::clone(&on_error),
    ));

    let checker = SessionChecker::new(
        &config.identity_service_url,
        RetryPolicy::with_max_attempts(config.whoami_attempts),
        config.whoami_timeout,
    )?;
    info!("Session checks against {}", checker.whoami_url());

    let bridge = Arc::new(SessionJwtBridge::new(
        Arc::clone(&config),
        checker,
        keys,
        proxy,
        on_error,
    ));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);
    for path in config.jwks_paths() {
        info!("JWKS published at {}{}", config.public_url.as_str().trim_end_matches('/'), path);
    }

    if !config.no_auto_open {
        tokio::task::spawn(open_browser(config.public_url.clone()));
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let io = TokioIo::new(stream);
                let bridge = Arc::clone(&bridge);

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let bridge = Arc::clone(&bridge);
                        async move { Ok::<_, Infallible>(bridge.handle(req).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down identity-gateway");
                return Ok(());
            }
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

fn build_middleware(config: &ProxyConfig) -> MiddlewareChain {
    let mut chain = MiddlewareChain::new().add(LoggingMiddleware);
    if let Some(redirect_to) = &config.default_redirect_url {
        let welcome = WelcomeRedirectMiddleware::new(&config.path_prefix, redirect_to.clone());
        info!("Redirecting {} to {}", welcome.welcome_path(), redirect_to);
        chain = chain.add(welcome);
    }
    chain
}

/// Open `url` with the platform's default browser
async fn open_browser(url: Url) {
    let mut command = if cfg!(target_os = "macos") {
        ProcessCommand::new("open")
    } else if cfg!(target_os = "windows") {
        let mut command = ProcessCommand::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else {
        ProcessCommand::new("xdg-open")
    };

    match command.arg(url.as_str()).status().await {
        Ok(status) if status.success() => debug!("Opened {} in the browser", url),
        Ok(status) => warn!("Browser launcher exited with {}", status),
        Err(e) => warn!("Could not open a browser for {}: {}", url, e),
    }
}
