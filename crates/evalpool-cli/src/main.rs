// Copyright 2025 evalpool Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! # evalpool CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the JSON-RPC endpoint with a config file
//! evalpool serve -c evalpool.json -b 127.0.0.1:8080
//!
//! # Override individual settings on the command line
//! evalpool serve --pool-size 8 --default-timeout-ms 5000
//!
//! # Run one script locally and print the response
//! evalpool run script.js --timeout-ms 1000
//! ```
//!
//! The config file is a JSON document with an `evalpool` section:
//!
//! ```json
//! { "evalpool": { "pool_size": 4, "default_timeout_ms": 30000 } }
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use evalpool_common::protocol::ExecuteRequest;
use evalpool_server::config::CONFIG_SECTION;
use evalpool_server::http_server::HttpServer;
use evalpool_server::{Engine, EngineConfig, JsonConfigSource};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(FromArgs)]
/// evalpool - pooled JavaScript execution engine
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Run(RunArgs),
}

/// Arguments for the `serve` subcommand.
///
/// Settings from `--config` are applied first, then every flag that was
/// given overrides the matching field.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the execution call over JSON-RPC/HTTP
struct ServeArgs {
    /// path to a JSON config file with an `evalpool` section
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"127.0.0.1:8080\".into()")]
    bind: String,

    /// number of interpreters (1-100)
    #[argh(option, long = "pool-size")]
    pool_size: Option<usize>,

    /// deadline for requests without their own timeout_ms
    #[argh(option, long = "default-timeout-ms")]
    default_timeout_ms: Option<u64>,

    /// how long a timed-out script may take to stop before its interpreter
    /// is replaced
    #[argh(option, long = "interrupt-grace-ms")]
    interrupt_grace_ms: Option<u64>,

    /// how long shutdown waits for in-flight executions
    #[argh(option, long = "shutdown-grace-ms", default = "5000")]
    shutdown_grace_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// run one script file and print the response as JSON
struct RunArgs {
    /// path to the script to execute
    #[argh(positional)]
    script: PathBuf,

    /// execution deadline in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<i64>,

    /// correlation id echoed in the response
    #[argh(option, long = "request-id")]
    request_id: Option<String>,
}

impl ServeArgs {
    fn config_source(&self) -> Result<JsonConfigSource> {
        let mut source = match &self.config {
            Some(path) => JsonConfigSource::from_path(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => JsonConfigSource::from_value(json!({ CONFIG_SECTION: {} })),
        };

        if let Some(pool_size) = self.pool_size {
            source.set(CONFIG_SECTION, "pool_size", json!(pool_size));
        }
        if let Some(timeout) = self.default_timeout_ms {
            source.set(CONFIG_SECTION, "default_timeout_ms", json!(timeout));
        }
        if let Some(grace) = self.interrupt_grace_ms {
            source.set(CONFIG_SECTION, "interrupt_grace_ms", json!(grace));
        }
        Ok(source)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so `run` output stays pipeable.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Run(args) => run_script(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let addr: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let engine = Engine::init(&args.config_source()?)?;
    let mut errors = engine.start()?;

    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            tracing::error!("Engine error: {}", err);
        }
    });

    let server = HttpServer::new(engine.rpc()?);
    let served = server
        .run(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await;

    engine
        .stop(Duration::from_millis(args.shutdown_grace_ms))
        .await?;
    served?;
    Ok(())
}

async fn run_script(args: RunArgs) -> Result<()> {
    let code = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))?;

    let engine = Engine::with_config(EngineConfig::new().with_pool_size(1))?;
    let _errors = engine.start()?;

    let mut request = ExecuteRequest::new(code);
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout_ms(timeout_ms);
    }
    if let Some(request_id) = args.request_id {
        request = request.with_request_id(request_id);
    }

    let response = engine.rpc()?.execute(request).await;
    engine.stop(Duration::from_secs(1)).await?;

    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.is_success() {
        anyhow::bail!("script failed: {}", response.error);
    }
    Ok(())
}
