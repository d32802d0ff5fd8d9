use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use identity_core::{ProxyConfig, ProxyConfigBuilder};
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "identity-gateway", version)]
#[command(about = "Identity-aware reverse proxy that co-locates an identity service with your application")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Proxy an application and mount the identity service below a path prefix
    Proxy(ProxyArgs),

    /// Expose the identity service on its own local port
    Tunnel(TunnelArgs),
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// Application to proxy, e.g. http://localhost:3000
    pub upstream: Url,

    /// Public URL the proxy is reached at (default: http://localhost:<port>)
    pub public_url: Option<Url>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct TunnelArgs {
    /// URL of the application using the tunnel, e.g. http://localhost:3000
    pub application_url: Url,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = identity_core::config::DEFAULT_PORT)]
    pub port: u16,

    /// Domain written into rewritten cookies (default: host of the public URL)
    #[arg(long)]
    pub cookie_domain: Option<String>,

    /// Do not mint JWTs for authenticated requests
    #[arg(long)]
    pub no_jwt: bool,

    /// Open the public URL in a browser once listening
    #[arg(long)]
    pub open: bool,

    /// Where to send users instead of the identity service's welcome page
    #[arg(long)]
    pub default_redirect_url: Option<Url>,

    /// Path prefix the identity service is mounted under
    #[arg(long)]
    pub path_prefix: Option<String>,

    /// Identity service URL
    #[arg(long, env = "ORY_SDK_URL")]
    pub sdk_url: Option<Url>,

    /// Deprecated alias of --sdk-url
    #[arg(long, env = "ORY_KRATOS_URL", hide = true)]
    pub kratos_url: Option<Url>,

    /// Upstream response timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub upstream_timeout: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    pub fn common(&self) -> &CommonArgs {
        match &self.command {
            Command::Proxy(args) => &args.common,
            Command::Tunnel(args) => &args.common,
        }
    }

    /// Turn parsed arguments into a validated configuration
    pub fn into_config(self) -> Result<ProxyConfig> {
        let (builder, common) = match self.command {
            Command::Proxy(args) => {
                let identity = identity_service_url(&args.common)?;
                let builder = ProxyConfig::proxy(args.upstream, identity).public_url(args.public_url);
                (builder, args.common)
            }
            Command::Tunnel(args) => {
                let identity = identity_service_url(&args.common)?;
                (ProxyConfig::tunnel(args.application_url, identity), args.common)
            }
        };
        apply_common(builder, common)
            .build()
            .context("invalid proxy configuration")
    }
}

fn apply_common(builder: ProxyConfigBuilder, common: CommonArgs) -> ProxyConfigBuilder {
    builder
        .port(common.port)
        .cookie_domain(common.cookie_domain)
        .no_jwt(common.no_jwt)
        .auto_open(common.open)
        .default_redirect_url(common.default_redirect_url)
        .path_prefix(common.path_prefix)
        .upstream_timeout(Duration::from_secs(common.upstream_timeout))
}

/// `--sdk-url` wins over the legacy `--kratos-url`
fn identity_service_url(common: &CommonArgs) -> Result<Url> {
    match (&common.sdk_url, &common.kratos_url) {
        (Some(url), _) => Ok(url.clone()),
        (None, Some(url)) => {
            tracing::warn!("ORY_KRATOS_URL is deprecated, use ORY_SDK_URL instead");
            Ok(url.clone())
        }
        (None, None) => bail!("the identity service URL is required: set --sdk-url or ORY_SDK_URL"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_core::ProxyMode;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_proxy_command() {
        let cli = parse(&[
            "identity-gateway",
            "proxy",
            "http://localhost:3000",
            "--sdk-url",
            "https://slug.projects.example.com",
            "--port",
            "4100",
            "--no-jwt",
        ]);
        assert_eq!(cli.common().log_format, LogFormat::Text);

        let config = cli.into_config().unwrap();
        assert_eq!(config.mode, ProxyMode::Proxy);
        assert_eq!(config.port, 4100);
        assert!(config.no_jwt);
        assert!(config.no_auto_open);
        assert_eq!(config.path_prefix, "/.ory");
        assert_eq!(config.public_url.as_str(), "http://localhost:4100/");
        assert_eq!(config.identity_service_url.as_str(), "https://slug.projects.example.com/");
    }

    #[test]
    fn test_tunnel_command() {
        let cli = parse(&[
            "identity-gateway",
            "tunnel",
            "http://localhost:3000",
            "--kratos-url",
            "https://legacy.example.com",
            "--open",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.common().log_format, LogFormat::Json);

        let config = cli.into_config().unwrap();
        assert_eq!(config.mode, ProxyMode::Tunnel);
        assert!(!config.no_auto_open);
        assert_eq!(config.path_prefix, "");
        assert_eq!(config.identity_service_url.as_str(), "https://legacy.example.com/");
        assert_eq!(
            config.default_redirect_url.map(|u| u.to_string()),
            Some("http://localhost:3000/".to_string())
        );
    }

    #[test]
    fn test_sdk_url_wins_over_kratos_url() {
        let cli = parse(&[
            "identity-gateway",
            "tunnel",
            "http://localhost:3000",
            "--sdk-url",
            "https://new.example.com",
            "--kratos-url",
            "https://old.example.com",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.identity_service_url.as_str(), "https://new.example.com/");
    }

    #[test]
    fn test_invalid_prefix_is_rejected() {
        let cli = parse(&[
            "identity-gateway",
            "proxy",
            "http://localhost:3000",
            "--sdk-url",
            "https://slug.projects.example.com",
            "--path-prefix",
            "ory/",
        ]);
        assert!(cli.into_config().is_err());
    }
}
