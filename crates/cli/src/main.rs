use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use lib::gatekeeper::{Directive, ExecutionResult, Gatekeeper};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "archdash")]
#[command(about = "ArchDash CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: ARCHDASH_CONFIG_PATH or ~/.archdash/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket) that serves terminal sessions.
    Gateway {
        /// Config file path (default: ARCHDASH_CONFIG_PATH or ~/.archdash/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run one command through the gatekeeper in this process and print its output.
    Exec {
        /// Config file path (default: ARCHDASH_CONFIG_PATH or ~/.archdash/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print the raw result as JSON.
        #[arg(long)]
        json: bool,

        /// Command line, e.g. `archdash exec -- pacman -Ss vim`.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List the command policy table.
    Policy {
        /// Config file path (default: ARCHDASH_CONFIG_PATH or ~/.archdash/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Interactive terminal session via the gateway.
    Shell {
        /// Config file path (default: ARCHDASH_CONFIG_PATH or ~/.archdash/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("archdash {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Exec {
            config,
            json,
            command,
        }) => match run_exec(config, json, command).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                log::error!("exec failed: {:#}", e);
                std::process::exit(1);
            }
        },
        Some(Commands::Policy { config }) => {
            if let Err(e) = run_policy(config) {
                log::error!("policy failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Shell { config }) => {
            if let Err(e) = run_shell(config).await {
                log::error!("shell failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path).await
}

/// Returns whether the command succeeded (special commands count as success).
async fn run_exec(config_path: Option<PathBuf>, json: bool, command: Vec<String>) -> anyhow::Result<bool> {
    let (config, _) = lib::config::load_config(config_path)?;
    let gatekeeper = Gatekeeper::new(
        Arc::new(lib::policy::PolicyTable::builtin()),
        lib::exec::SandboxSettings::from_config(&config.terminal),
    );
    let result = gatekeeper.execute(&command.join(" ")).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.succeeded)
}

fn print_result(result: &ExecutionResult) {
    if result.output.is_empty() {
        return;
    }
    if result.succeeded {
        println!("{}", result.output);
    } else {
        eprintln!("{}", result.output);
    }
}

fn run_policy(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    // Config is loaded only so a broken file is reported the same way as for other commands.
    let _ = lib::config::load_config(config_path)?;
    let table = lib::policy::PolicyTable::builtin();
    println!("{:<12} {:<16} {:<9} {:>8}  NOTES", "COMMAND", "CATEGORY", "STATUS", "TIMEOUT");
    for p in table.entries() {
        let status = if !p.permitted {
            "denied"
        } else if p.requires_elevation {
            "elevated"
        } else if p.requires_interactive_terminal {
            "tty"
        } else {
            "allowed"
        };
        let mut notes = Vec::new();
        if let Some(ref reason) = p.danger_reason {
            notes.push(reason.clone());
        } else {
            notes.push(p.description.clone());
        }
        if let Some(ref flags) = p.allowed_flags {
            notes.push(format!("flags: {}", flags.iter().cloned().collect::<Vec<_>>().join(" ")));
        }
        if let Some(ref rule) = p.subcommands {
            notes.push(format!("subcommands: {}", rule.allowed_names().join(" ")));
        }
        println!(
            "{:<12} {:<16} {:<9} {:>6}ms  {}",
            p.name,
            p.category.label(),
            status,
            p.timeout_ms,
            notes.join("; ")
        );
    }
    Ok(())
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One connected gateway WebSocket, request ids assigned in order.
struct GatewayClient {
    ws: WsStream,
    next_id: u64,
}

impl GatewayClient {
    async fn connect(config: &lib::config::Config) -> Result<Self, String> {
        let bind = config.gateway.bind.trim();
        let ws_url = format!("ws://{}:{}/ws", bind, config.gateway.port);
        let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| format!("{} ({})", e, ws_url))?;

        let first = ws
            .next()
            .await
            .ok_or("no first frame")?
            .map_err(|e| e.to_string())?;
        let Message::Text(challenge_text) = first else {
            return Err("expected text challenge frame".to_string());
        };
        let challenge: serde_json::Value =
            serde_json::from_str(&challenge_text).map_err(|e| e.to_string())?;
        if challenge.get("event").and_then(|v| v.as_str()) != Some("connect.challenge") {
            return Err("expected connect.challenge event".to_string());
        }

        let mut client = Self { ws, next_id: 1 };
        let mut params = serde_json::json!({
            "client": { "id": "archdash-cli", "version": env!("CARGO_PKG_VERSION") },
        });
        if let Some(token) = lib::config::resolve_gateway_token(config) {
            params["auth"] = serde_json::json!({ "token": token });
        }
        client.call("connect", params).await?;
        Ok(client)
    }

    /// Send a request and wait for its response payload.
    async fn call(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, String> {
        let id = self.next_id.to_string();
        self.next_id += 1;
        let req = serde_json::json!({
            "type": "req",
            "id": id,
            "method": method,
            "params": params
        });
        self.ws
            .send(Message::Text(req.to_string()))
            .await
            .map_err(|e| e.to_string())?;

        while let Some(msg) = self.ws.next().await {
            let msg = msg.map_err(|e| e.to_string())?;
            let Message::Text(text) = msg else { continue };
            let res: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
            if res.get("event").and_then(|v| v.as_str()) == Some("shutdown") {
                return Err("gateway shut down".to_string());
            }
            if res.get("type").and_then(|v| v.as_str()) != Some("res") {
                continue;
            }
            if res.get("id").and_then(|v| v.as_str()) == Some(id.as_str()) {
                if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                    let err = res
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("request failed");
                    return Err(err.to_string());
                }
                return Ok(res.get("payload").cloned().unwrap_or(serde_json::Value::Null));
            }
        }
        Err(format!("no response to {}", method))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPayload {
    session_id: String,
}

async fn run_shell(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = lib::config::load_config(config_path)?;
    let mut client = GatewayClient::connect(&config)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to gateway: {}", e))?;
    let open: OpenPayload = serde_json::from_value(
        client
            .call("terminal.open", serde_json::json!({}))
            .await
            .map_err(anyhow::Error::msg)?,
    )?;
    log::info!("terminal session {}", open.session_id);
    println!("ArchDash terminal. Type 'help' for available commands, 'exit' to leave.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "user@archlinux:~$ ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            let _ = client
                .call("terminal.close", serde_json::json!({ "sessionId": open.session_id }))
                .await;
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let payload = client
            .call(
                "terminal.execute",
                serde_json::json!({ "command": line.trim(), "sessionId": open.session_id }),
            )
            .await;
        let result: ExecutionResult = match payload.and_then(|p| serde_json::from_value(p).map_err(|e| e.to_string())) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("shell error: {}", e);
                if e == "gateway shut down" {
                    break;
                }
                continue;
            }
        };
        match result.special {
            Some(Directive::Clear) => {
                write!(stdout, "\x1b[2J\x1b[H")?;
                stdout.flush()?;
            }
            Some(Directive::Exit) => break,
            None => print_result(&result),
        }
    }
    Ok(())
}
