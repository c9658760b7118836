//! ArchDash Desktop: egui app state and UI.

use eframe::egui;
use futures_util::{SinkExt, StreamExt};
use lib::command::{Intent, SpecialCommand};
use lib::gatekeeper::{Directive, ExecutionResult};
use std::collections::VecDeque;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const LOG_BUFFER_MAX_LINES: usize = 2000;
const PROMPT: &str = "user@archlinux:~$";

/// Ring buffer of log lines for the Logs screen. Written by DesktopLogger and gateway output readers.
static LOG_LINES: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn log_buffer() -> &'static Mutex<VecDeque<String>> {
    LOG_LINES.get_or_init(|| Mutex::new(VecDeque::new()))
}

fn push_log_line(line: String) {
    if let Ok(mut buf) = log_buffer().lock() {
        buf.push_back(line);
        while buf.len() > LOG_BUFFER_MAX_LINES {
            buf.pop_front();
        }
    }
}

/// Logger that appends to LOG_LINES for display in the Logs screen.
struct DesktopLogger;

impl log::Log for DesktopLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        push_log_line(format!(
            "{} [{}] {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: DesktopLogger = DesktopLogger;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
enum Screen {
    #[default]
    Terminal,
    Logs,
}

/// One rendered block in the terminal view.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TerminalLine {
    Command(String),
    Output { text: String, failed: bool },
    Notice(String),
}

/// Terminal scrollback, capped at a fixed number of blocks (oldest dropped first).
#[derive(Debug)]
struct TerminalBuffer {
    lines: VecDeque<TerminalLine>,
    limit: usize,
}

impl TerminalBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    fn push(&mut self, line: TerminalLine) {
        self.lines.push_back(line);
        while self.lines.len() > self.limit {
            self.lines.pop_front();
        }
    }

    fn clear(&mut self) {
        self.lines.clear();
    }

    /// Apply a gatekeeper result; returns true when the session ended.
    fn apply(&mut self, result: &ExecutionResult) -> bool {
        match result.special {
            Some(Directive::Clear) => {
                self.clear();
                false
            }
            Some(Directive::Exit) => {
                self.clear();
                self.push(TerminalLine::Notice(
                    "Session closed. Type a command to start a new one.".to_string(),
                ));
                true
            }
            None => {
                if !result.output.is_empty() {
                    self.push(TerminalLine::Output {
                        text: result.output.clone(),
                        failed: !result.succeeded,
                    });
                }
                false
            }
        }
    }
}

/// A line that clears the screen (`clear`, `clear foo`) is not echoed; the reply wipes it anyway.
fn echoes_prompt(command: &str) -> bool {
    !matches!(
        lib::command::classify(command),
        Intent::Special(SpecialCommand::Clear)
    )
}

/// Reply from one `terminal.execute` round trip.
struct TerminalReply {
    session_id: String,
    result: ExecutionResult,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Open a WebSocket to the configured gateway and complete the connect handshake.
async fn connect_gateway(config: &lib::config::Config) -> Result<WsStream, String> {
    let ws_url = format!("ws://{}:{}/ws", config.gateway.bind.trim(), config.gateway.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| e.to_string())?;

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

    let mut params = serde_json::json!({
        "client": { "id": "archdash-desktop", "platform": std::env::consts::OS },
    });
    if let Some(token) = lib::config::resolve_gateway_token(config) {
        params["auth"] = serde_json::json!({ "token": token });
    }
    request(&mut ws, "1", "connect", params).await?;
    Ok(ws)
}

/// Send one request and wait for the matching response payload.
async fn request(
    ws: &mut WsStream,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, String> {
    let req = serde_json::json!({
        "type": "req",
        "id": id,
        "method": method,
        "params": params
    });
    ws.send(Message::Text(req.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        let res: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        if res.get("type").and_then(|v| v.as_str()) != Some("res") {
            continue;
        }
        if res.get("id").and_then(|v| v.as_str()) == Some(id) {
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
    Err(format!("no {} response", method))
}

fn block_on_gateway<T>(
    f: impl FnOnce(lib::config::Config) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, String>>>>,
) -> Result<T, String> {
    let (config, _) = lib::config::load_config(None).map_err(|e| e.to_string())?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;
    rt.block_on(f(config))
}

/// Run one command through the gateway, opening a session first when there is none. Runs in a thread.
fn run_terminal_command(session_id: Option<String>, command: String) -> Result<TerminalReply, String> {
    block_on_gateway(move |config| {
        Box::pin(async move {
            let mut ws = connect_gateway(&config).await?;
            let session_id = match session_id {
                Some(id) => id,
                None => {
                    let payload = request(&mut ws, "2", "terminal.open", serde_json::json!({})).await?;
                    payload
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .ok_or("missing sessionId in terminal.open response")?
                        .to_string()
                }
            };
            let payload = request(
                &mut ws,
                "3",
                "terminal.execute",
                serde_json::json!({ "command": command, "sessionId": session_id }),
            )
            .await?;
            let result: ExecutionResult =
                serde_json::from_value(payload).map_err(|e| e.to_string())?;
            Ok(TerminalReply { session_id, result })
        })
    })
}

fn close_terminal_session(session_id: String) {
    std::thread::spawn(move || {
        let closed = block_on_gateway(move |config| {
            Box::pin(async move {
                let mut ws = connect_gateway(&config).await?;
                request(
                    &mut ws,
                    "2",
                    "terminal.close",
                    serde_json::json!({ "sessionId": session_id }),
                )
                .await
            })
        });
        if let Err(e) = closed {
            log::debug!("closing terminal session failed: {}", e);
        }
    });
}

/// Resolve the archdash CLI binary: same directory as this executable, or "archdash" from PATH.
fn resolve_archdash_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let name = if cfg!(windows) { "archdash.exe" } else { "archdash" };
    let candidate = dir.join(name);
    if candidate.exists() {
        return Some(candidate);
    }
    Some(PathBuf::from("archdash"))
}

fn forward_output<R: std::io::Read + Send + 'static>(reader: R) {
    std::thread::spawn(move || {
        for line in std::io::BufReader::new(reader).lines().map_while(Result::ok) {
            push_log_line(format!("[gateway] {}", line));
        }
    });
}

/// Frames between gateway probes (probe at ~1 Hz if 60 fps).
const PROBE_INTERVAL_FRAMES: u32 = 60;

pub struct ArchDashApp {
    /// When Some, the gateway subprocess is running. Cleared when process exits or we stop it.
    gateway_process: Option<Child>,
    /// Last error from start gateway (e.g. spawn failed).
    gateway_error: Option<String>,
    /// True if the configured gateway address:port accepted a TCP connection (we or someone else).
    gateway_responds: bool,
    gateway_probe_completed: bool,
    probe_receiver: Option<mpsc::Receiver<bool>>,
    frames_since_probe: u32,
    /// Gateway terminal session; None until the first command.
    session_id: Option<String>,
    buffer: TerminalBuffer,
    input: String,
    /// When Some, a command is in flight; we read the result here.
    command_receiver: Option<mpsc::Receiver<Result<TerminalReply, String>>>,
    current_screen: Screen,
    was_gateway_running: bool,
}

impl ArchDashApp {
    const SCREEN_TITLE_BOTTOM_SPACING: f32 = 18.0;
    const SCREEN_FOOTER_SPACING: f32 = 48.0;

    pub fn new(_cc: &eframe::CreationContext<'_>) -> Self {
        let _ = log_buffer();
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Debug);
        let history_limit = lib::config::load_config(None)
            .map(|(c, _)| c.terminal.history_limit)
            .unwrap_or_else(|e| {
                log::warn!("failed to load config: {}", e);
                lib::config::TerminalConfig::default().history_limit
            });
        log::info!("desktop started");
        Self {
            gateway_process: None,
            gateway_error: None,
            gateway_responds: false,
            gateway_probe_completed: false,
            probe_receiver: None,
            frames_since_probe: PROBE_INTERVAL_FRAMES,
            session_id: None,
            buffer: TerminalBuffer::new(history_limit),
            input: String::new(),
            command_receiver: None,
            current_screen: Screen::default(),
            was_gateway_running: false,
        }
    }

    /// Poll for probe result and optionally start a new probe. Call each frame.
    fn poll_gateway_probe(&mut self) {
        if let Some(rx) = &self.probe_receiver {
            if let Ok(ok) = rx.try_recv() {
                self.gateway_probe_completed = true;
                self.gateway_responds = ok;
                self.probe_receiver = None;
            }
        }
        self.frames_since_probe = self.frames_since_probe.saturating_add(1);
        if self.probe_receiver.is_none() && self.frames_since_probe >= PROBE_INTERVAL_FRAMES {
            self.frames_since_probe = 0;
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let config = lib::config::load_config(None)
                    .map(|(c, _)| c)
                    .unwrap_or_default();
                let addr_str = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
                let ok = addr_str
                    .parse::<SocketAddr>()
                    .ok()
                    .and_then(|addr| {
                        std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(800)).ok()
                    })
                    .is_some();
                let _ = tx.send(ok);
            });
            self.probe_receiver = Some(rx);
        }
    }

    fn poll_command(&mut self) {
        let Some(rx) = &self.command_receiver else { return };
        let Ok(reply) = rx.try_recv() else { return };
        self.command_receiver = None;
        match reply {
            Ok(reply) => {
                let ended = self.buffer.apply(&reply.result);
                self.session_id = if ended { None } else { Some(reply.session_id) };
            }
            Err(e) => {
                log::warn!("terminal command failed: {}", e);
                self.buffer.push(TerminalLine::Output {
                    text: format!("gateway error: {}", e),
                    failed: true,
                });
            }
        }
    }

    /// True if we started the gateway and it is still running (we can stop it).
    fn gateway_owned(&mut self) -> bool {
        if let Some(ref mut child) = self.gateway_process {
            if child.try_wait().ok().flatten().is_some() {
                self.gateway_process = None;
                return false;
            }
            return true;
        }
        false
    }

    fn start_gateway(&mut self) {
        self.gateway_error = None;
        let (config, _) = match lib::config::load_config(None) {
            Ok(pair) => pair,
            Err(e) => {
                self.gateway_error = Some(format!("failed to load config: {}", e));
                return;
            }
        };
        let Some(binary) = resolve_archdash_binary() else {
            self.gateway_error = Some("could not find archdash binary".to_string());
            return;
        };
        let child = std::process::Command::new(&binary)
            .args(["gateway", "--port", &config.gateway.port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match child {
            Ok(mut c) => {
                if let Some(stderr) = c.stderr.take() {
                    forward_output(stderr);
                }
                if let Some(stdout) = c.stdout.take() {
                    forward_output(stdout);
                }
                log::info!("gateway started from {}", binary.display());
                self.gateway_process = Some(c);
            }
            Err(e) => {
                self.gateway_error = Some(format!("failed to start gateway: {}", e));
            }
        }
    }

    fn stop_gateway(&mut self) {
        if let Some(mut child) = self.gateway_process.take() {
            let _ = child.kill();
        }
        self.gateway_error = None;
    }

    /// Submit a line to the gateway in a background thread.
    fn submit(&mut self, line: String) {
        if self.command_receiver.is_some() {
            return;
        }
        let command = line.trim().to_string();
        if command.is_empty() {
            return;
        }
        if echoes_prompt(&command) {
            self.buffer
                .push(TerminalLine::Command(format!("{} {}", PROMPT, command)));
        }
        let session_id = self.session_id.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(run_terminal_command(session_id, command));
        });
        self.command_receiver = Some(rx);
    }

    fn new_terminal(&mut self) {
        if let Some(id) = self.session_id.take() {
            close_terminal_session(id);
        }
        self.command_receiver = None;
        self.buffer.clear();
        self.input.clear();
    }

    fn ui_terminal(&mut self, ui: &mut egui::Ui, running: bool) {
        ui.add_space(24.0);
        ui.horizontal(|ui| {
            ui.heading("Terminal");
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                if ui.add_enabled(running, egui::Button::new("New terminal")).clicked() {
                    self.new_terminal();
                }
                if ui.add_enabled(running, egui::Button::new("Clear")).clicked() {
                    self.submit("clear".to_string());
                }
            });
        });
        ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);
        if !running {
            ui.label("Start the gateway to run commands.");
            ui.add_space(8.0);
        }

        let input_height = 36.0;
        let scroll_height =
            (ui.available_height() - input_height - Self::SCREEN_FOOTER_SPACING).max(0.0);
        egui::Frame::none()
            .fill(ui.style().visuals.extreme_bg_color)
            .inner_margin(egui::Margin::same(8.0))
            .show(ui, |ui| {
                egui::ScrollArea::vertical()
                    .max_height(scroll_height)
                    .auto_shrink([false, false])
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        if self.buffer.lines.is_empty() {
                            ui.label(
                                egui::RichText::new("Type 'help' for available commands.")
                                    .family(egui::FontFamily::Monospace)
                                    .weak(),
                            );
                        }
                        for line in &self.buffer.lines {
                            let text = match line {
                                TerminalLine::Command(c) => egui::RichText::new(c.as_str()).strong(),
                                TerminalLine::Output { text, failed: true } => {
                                    egui::RichText::new(text.as_str()).color(ui.visuals().error_fg_color)
                                }
                                TerminalLine::Output { text, failed: false } => {
                                    egui::RichText::new(text.as_str())
                                }
                                TerminalLine::Notice(n) => egui::RichText::new(n.as_str()).italics(),
                            };
                            ui.label(text.family(egui::FontFamily::Monospace));
                        }
                        if self.command_receiver.is_some() {
                            ui.spinner();
                        }
                    });
            });

        ui.add_space(8.0);
        ui.horizontal(|ui| {
            ui.label(egui::RichText::new(PROMPT).family(egui::FontFamily::Monospace));
            let enabled = running && self.command_receiver.is_none();
            let response = ui.add_enabled(
                enabled,
                egui::TextEdit::singleline(&mut self.input)
                    .font(egui::TextStyle::Monospace)
                    .desired_width(f32::INFINITY),
            );
            if response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                let line = std::mem::take(&mut self.input);
                self.submit(line);
                response.request_focus();
            }
        });
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }

    fn ui_logs_screen(&self, ui: &mut egui::Ui) {
        ui.add_space(24.0);
        ui.heading("Logs");
        ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);

        let lines: Vec<String> = log_buffer()
            .lock()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default();

        let scroll_height = (ui.available_height() - Self::SCREEN_FOOTER_SPACING).max(0.0);
        egui::ScrollArea::vertical()
            .max_height(scroll_height)
            .stick_to_bottom(true)
            .show(ui, |ui| {
                for line in &lines {
                    ui.label(egui::RichText::new(line.as_str()).family(egui::FontFamily::Monospace));
                }
                if lines.is_empty() {
                    ui.label("No log output yet.");
                }
            });
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }
}

impl eframe::App for ArchDashApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_gateway_probe();
        self.poll_command();
        let owned = self.gateway_owned();
        let running = owned || self.gateway_responds;
        if self.was_gateway_running && !running {
            // Sessions live in the gateway; a restarted gateway knows none of them.
            self.session_id = None;
            self.command_receiver = None;
        }
        self.was_gateway_running = running;

        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            egui::Frame::none()
                .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                .show(ui, |ui| {
                    ui.add_space(16.0);
                    ui.horizontal(|ui| {
                        ui.heading("ArchDash");
                        ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                            if !self.gateway_probe_completed {
                                ui.add_enabled(false, egui::Button::new("Start gateway"));
                            } else if running {
                                if owned {
                                    if ui.button("Stop gateway").clicked() {
                                        self.stop_gateway();
                                    }
                                } else {
                                    ui.add_enabled(false, egui::Button::new("Gateway running"));
                                }
                            } else if ui.button("Start gateway").clicked() {
                                self.start_gateway();
                            }
                            if let Some(ref e) = self.gateway_error {
                                ui.colored_label(ui.visuals().error_fg_color, e);
                            }
                        });
                    });
                    ui.add_space(16.0);
                });
        });

        let current_screen = &mut self.current_screen;
        egui::SidePanel::left("sidebar")
            .resizable(false)
            .exact_width(140.0)
            .show(ctx, |ui| {
                egui::Frame::none()
                    .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                    .show(ui, |ui| {
                        ui.add_space(24.0);
                        if ui
                            .selectable_label(*current_screen == Screen::Terminal, "Terminal")
                            .clicked()
                        {
                            *current_screen = Screen::Terminal;
                        }
                        ui.add_space(12.0);
                        if ui.selectable_label(*current_screen == Screen::Logs, "Logs").clicked() {
                            *current_screen = Screen::Logs;
                        }
                    });
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            egui::Frame::none()
                .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                .show(ui, |ui| match self.current_screen {
                    Screen::Terminal => self.ui_terminal(ui, running),
                    Screen::Logs => self.ui_logs_screen(ui),
                });
        });

        if self.command_receiver.is_some() || self.probe_receiver.is_some() {
            ctx.request_repaint_after(Duration::from_millis(50));
        } else {
            ctx.request_repaint_after(Duration::from_millis(500));
        }
    }
}
