use anyhow::Result;
use clap::Parser;
use imgconvert::app::App;
use imgconvert::models::Config;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "imgconvert")]
#[command(about = "Batch image conversion service with time-limited downloads")]
struct CliArgs {
    /// Address to bind, overriding HOST.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding PORT.
    #[arg(short, long)]
    port: Option<u16>,
}

impl CliArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imgconvert=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting imgconvert");

    let args = CliArgs::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    match App::new(config) {
        Ok(app) => match app.run().await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CliArgs;
    use clap::Parser;
    use imgconvert::models::Config;

    #[test]
    fn test_cli_overrides_config() {
        let args = CliArgs::parse_from(["imgconvert", "--host", "127.0.0.1", "-p", "8081"]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8081);
    }

    #[test]
    fn test_cli_defaults_keep_config() {
        let args = CliArgs::parse_from(["imgconvert"]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.port, 3000);
    }
}
