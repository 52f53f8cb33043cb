use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use snap_exec::capability::builtin::FileStateStore;
use snap_exec::capability::{CapabilityCatalog, HostHooks};
use snap_exec::config::Config;
use snap_exec::error::{ExecutionError, RpcError};
use snap_exec::execution::ExecutionService;
use snap_exec::runtime::ProcessRuntime;
use snap_exec::snap::{HandlerType, SnapId, SnapRequest};

fn print_help() {
    println!(
        "\
snap-exec v{}

Runs untrusted snaps in sandboxed child processes and serves requests to
them as JSON lines on stdin/stdout.

USAGE:
    snap-exec [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/snap-exec.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

PROTOCOL:
    stdin     {{\"id\"?: ..., \"origin\": ..., \"snap_id\": ..., \"handler\"?: ..., \"request\": ...}}
    stdout    {{\"id\"?: ..., \"origin\": ..., \"snap_id\": ..., \"result\": ...}}
              {{\"id\"?: ..., \"origin\": ..., \"snap_id\": ..., \"error\": {{\"message\": ..., \"code\": ...}}}}
    The optional id is echoed back unchanged.

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing, written to stderr
                          (e.g. debug, snap_exec=debug,warn)
    SNAP_ENTROPY_SEED     Conventional source for [entropy] seed

EXAMPLES:
    snap-exec                                # uses config/snap-exec.toml
    snap-exec /etc/snap-exec/snap-exec.toml  # custom config path
    RUST_LOG=debug snap-exec                 # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

/// One request line on stdin.
#[derive(Debug, Deserialize)]
struct RequestLine {
    /// Caller's correlation id, echoed in the response.
    #[serde(default)]
    id: Option<Value>,
    origin: String,
    snap_id: SnapId,
    #[serde(default)]
    handler: HandlerType,
    request: Value,
}

/// One response line on stdout.
#[derive(Debug, Serialize)]
struct ResponseLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    origin: String,
    snap_id: SnapId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl ResponseLine {
    fn new(
        id: Option<Value>,
        origin: String,
        snap_id: SnapId,
        outcome: Result<Value, ExecutionError>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(result) => (Some(result), None),
            Err(e) => (None, Some(e.to_rpc_error())),
        };
        Self {
            id,
            origin,
            snap_id,
            result,
            error,
        }
    }
}

/// Decodes one stdin line. Blank and malformed lines yield `None`.
fn parse_request(line: &[u8]) -> Option<RequestLine> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!("Ignoring malformed request line: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("snap-exec v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout is the response channel, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("snap_exec=info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/snap-exec.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!(
        "Sandbox: {} {}",
        config.runtime.program.display(),
        config.runtime.args.join(" ")
    );
    info!(
        "Snaps: {}",
        config
            .snaps
            .iter()
            .map(|s| s.id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "Max queue size: {}, runtime mode: {:?}",
        config.service.max_queue_size, config.service.runtime_mode
    );

    // Host capabilities
    let state = Arc::new(FileStateStore::open(&config.state.path)?);
    let mut hooks = HostHooks::new(state);
    match config.entropy.seed_bytes()? {
        Some(seed) => hooks = hooks.with_entropy_seed(&seed),
        None => warn!("No entropy seed configured, derived values change on restart"),
    }
    let catalog = CapabilityCatalog::with_builtins(hooks);

    let runtime = ProcessRuntime::new(config.runtime.program.clone())
        .with_args(config.runtime.args.clone())
        .with_env(config.runtime.env.clone());
    let snaps = Arc::new(config.snaps());
    let service = Arc::new(ExecutionService::new(
        Arc::new(runtime),
        catalog,
        snaps.clone(),
        snaps,
        config.service.options(),
    ));
    let watcher = service.watch_permissions();

    // Single writer for stdout so response lines never interleave
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ResponseLine>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&response) else {
                continue;
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    info!("Ready, reading requests from stdin");
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = Vec::new();

    // ── Request loop ───────────────────────────────────────────────
    loop {
        line.clear();
        let read = tokio::select! {
            read = stdin.read_until(b'\n', &mut line) => read,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        };
        match read {
            Ok(0) => {
                info!("stdin closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Reading stdin failed: {e}");
                break;
            }
        }
        let Some(request) = parse_request(&line) else {
            continue;
        };
        debug!(origin = %request.origin, snap = %request.snap_id, "request received");

        // Each request runs on its own task so a slow snap doesn't block others
        let service = service.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let RequestLine {
                id,
                origin,
                snap_id,
                handler,
                request,
            } = request;
            let outcome = service
                .handle_request(&origin, &snap_id, SnapRequest { handler, request })
                .await;
            let _ = out_tx.send(ResponseLine::new(id, origin, snap_id, outcome));
        });
    }

    watcher.abort();
    service.terminate_all().await;
    drop(out_tx);
    // In-flight tasks hold writer handles until they finish; don't wait on them
    writer.abort();
    info!("Shutdown complete");
    Ok(())
}
