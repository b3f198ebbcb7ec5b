//! heim: heimdall CLI
//!
//! Drives a gateway built from the TOML configuration: one-shot
//! generation, health probes, model listing and a status dump.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use heimdall::{Config, GenerateOptions, GenerateRequest, HeimdallBuilder, ProviderId};

/// Heimdall CLI
#[derive(Parser)]
#[command(name = "heim")]
#[command(version)]
#[command(about = "Heimdall LLM resilience gateway")]
struct Args {
    /// Config file (default: ~/.heimdall/config.toml, then /etc/heimdall/config.toml)
    #[arg(short, long, env = "HEIMDALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate text
    Generate {
        /// Prompt (or omit to read from stdin)
        prompt: Option<String>,
        /// Model to use (default: the provider's configured model)
        #[arg(short, long)]
        model: Option<String>,
        /// System prompt
        #[arg(short, long)]
        system: Option<String>,
        /// Route to this provider instead of the configured default
        #[arg(short, long)]
        provider: Option<ProviderId>,
        #[arg(long)]
        max_tokens: Option<usize>,
        #[arg(long)]
        temperature: Option<f32>,
        /// Print chunks as they arrive
        #[arg(long)]
        stream: bool,
        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Probe provider health now
    Health {
        /// Single provider (default: all)
        provider: Option<ProviderId>,
    },

    /// List models a provider reports
    Models {
        /// Provider (default: the active one)
        provider: Option<ProviderId>,
    },

    /// Show routing, usage and rate limit state
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HEIMDALL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) if args.config.is_none() => {
            tracing::warn!(error = %e, "no config file, using a local ollama default");
            Config {
                enabled_providers: vec![ProviderId::Ollama],
                ..Config::default()
            }
        }
        Err(e) => return Err(e.into()),
    };

    #[allow(unused_mut)]
    let mut builder = HeimdallBuilder::from_config(&config)?;
    #[cfg(feature = "redis")]
    if let Some(url) = &config.cache.redis_url {
        match heimdall::RedisCacheClient::connect(url).await {
            Ok(client) => builder = builder.cache_client(std::sync::Arc::new(client)),
            Err(e) => tracing::warn!(error = %e, "redis unavailable, using local cache only"),
        }
    }
    let gateway = builder.build()?;

    match args.command {
        Command::Generate {
            prompt,
            model,
            system,
            provider,
            max_tokens,
            temperature,
            stream,
            no_cache,
        } => {
            if let Some(p) = provider {
                gateway.switcher().switch_method(p)?;
            }
            let mut options = GenerateOptions::new();
            options.max_tokens = max_tokens;
            options.temperature = temperature;
            let mut request = GenerateRequest::new(read_input(prompt)?).options(options);
            request.model = model;
            request.system_prompt = system;

            if stream {
                let mut chunks = gateway.stream_generate(&request).await?;
                let mut stdout = io::stdout();
                while let Some(chunk) = chunks.next().await {
                    stdout.write_all(chunk?.as_bytes())?;
                    stdout.flush()?;
                }
                println!();
            } else {
                let response = gateway.generate_with_cache(&request, !no_cache).await?;
                println!("{}", response.content);
                eprintln!(
                    "[{} / {}] {} tokens, {}ms{}",
                    response.provider,
                    response.model,
                    response.usage.total_tokens,
                    response.latency_ms,
                    if response.cached { ", cached" } else { "" }
                );
            }
        }
        Command::Health { provider } => {
            let records = gateway.health().force_health_check(provider).await?;
            for record in records {
                let status = if record.is_healthy { "healthy" } else { "UNHEALTHY" };
                let latency = record
                    .last_latency
                    .map(|l| format!("{}ms", l.as_millis()))
                    .unwrap_or_else(|| "-".to_string());
                match &record.last_error {
                    Some(err) => println!("{:<10} {:<10} {:>8}  {}", record.provider, status, latency, err),
                    None => println!("{:<10} {:<10} {:>8}", record.provider, status, latency),
                }
            }
        }
        Command::Models { provider } => {
            let provider = match provider {
                Some(p) => p,
                None => gateway.switcher().get_current_method()?,
            };
            for model in gateway.list_models(provider).await? {
                println!("{model}");
            }
        }
        Command::Status => {
            let routing = gateway.switcher().routing()?;
            println!("active:   {}", routing.current);
            println!(
                "fallback: {}",
                routing
                    .fallback
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            let enabled: Vec<String> = routing.enabled.iter().map(|p| p.to_string()).collect();
            println!("enabled:  {}", enabled.join(", "));
            println!();
            println!("{:<10} {:>8} {:>10} {:>8} {:>8}", "provider", "routed", "tokens", "max", "rate/s");
            let usage = gateway.switcher().get_usage_stats();
            for status in gateway.rate_limiter().get_all_status()? {
                let limit = if status.enabled {
                    (
                        format!("{:.1}", status.available_tokens),
                        format!("{:.0}", status.max_tokens),
                        format!("{:.2}", status.refill_rate),
                    )
                } else {
                    ("off".to_string(), "-".to_string(), "-".to_string())
                };
                println!(
                    "{:<10} {:>8} {:>10} {:>8} {:>8}",
                    status.provider,
                    usage.get(&status.provider).copied().unwrap_or(0),
                    limit.0,
                    limit.1,
                    limit.2
                );
            }
        }
    }

    Ok(())
}

/// Use the argument, or read stdin when it is piped.
fn read_input(arg: Option<String>) -> io::Result<String> {
    match arg {
        Some(text) => Ok(text),
        None if !io::stdin().is_terminal() => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            Ok(buf.trim_end().to_string())
        }
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no prompt given and stdin is a terminal",
        )),
    }
}
