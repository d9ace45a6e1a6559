use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use agent_substrate::config;
use agent_substrate::orchestrator::{ContainerPolicy, DockerContainerRuntime, Orchestrator};
use agent_substrate::proxy::whitelist::Whitelist;
use agent_substrate::run;

#[derive(Parser)]
#[command(name = "agent-substrate", about = "Execution substrate for a multi-tenant agent platform")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the ingress server (default)
	Serve,
	/// Run one container-orchestrator reap pass and print destroyed ids
	Reap,
	/// Evaluate the configured egress whitelist against a single host
	WhitelistCheck {
		host: String,
		#[arg(long, default_value = "GET")]
		method: String,
	},
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Serve) {
		Commands::Serve => run().await,
		Commands::Reap => {
			let settings = match config::load() {
				Ok(s) => s,
				Err(e) => {
					eprintln!("failed to load config: {}", e);
					return;
				}
			};
			let policy = ContainerPolicy::from_settings(&settings);
			let runtime = Arc::new(DockerContainerRuntime::new(
				settings.container_image.clone(),
				Duration::from_secs(30),
			));
			let orchestrator = Orchestrator::new(
				runtime,
				policy,
				settings.container_image.clone(),
				settings.container_base_dir.clone(),
				settings.proxy_socket_dir.clone(),
				settings.pool_size,
				Duration::from_secs(settings.idle_ttl_secs),
			);
			let destroyed = orchestrator.reap().await;
			if destroyed.is_empty() {
				println!("reap: nothing to destroy");
			} else {
				for id in destroyed {
					println!("reap: destroyed {}", id);
				}
			}
		}
		Commands::WhitelistCheck { host, method } => {
			let settings = match config::load() {
				Ok(s) => s,
				Err(e) => {
					eprintln!("failed to load config: {}", e);
					return;
				}
			};
			let whitelist = match &settings.whitelist_path {
				Some(path) => match std::fs::read_to_string(path).and_then(|data| {
					Whitelist::from_json(&data).map_err(|e| std::io::Error::other(e.to_string()))
				}) {
					Ok(w) => w,
					Err(e) => {
						eprintln!("failed to load whitelist at {}: {}", path, e);
						return;
					}
				},
				None => Whitelist::new(vec![]),
			};
			match whitelist.evaluate(&host, &method) {
				agent_substrate::proxy::whitelist::WhitelistVerdict::Allowed { signing_profile } => {
					println!("ALLOWED host={} method={} signing_profile={:?}", host, method, signing_profile);
				}
				agent_substrate::proxy::whitelist::WhitelistVerdict::Denied(reason) => {
					println!("DENIED host={} method={} reason={}", host, method, reason);
				}
			}
		}
	}
}
