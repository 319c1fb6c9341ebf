#![forbid(unsafe_code)]

//! `vdesk-ctl`: local CLI companion for `vdesk-orchestrator`.
//!
//! Connects to the control socket and sends one JSON command per
//! invocation.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "vdesk-ctl",
    about = "Local CLI for vdesk-orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// Control socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "vdesk-orchestrator")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Provision a new session.
    Create {
        /// Initial width in pixels.
        #[arg(long)]
        width: Option<i64>,
        /// Initial height in pixels.
        #[arg(long)]
        height: Option<i64>,
    },

    /// List live sessions.
    List,

    /// Show one session.
    Get {
        /// Session ID.
        id: String,
    },

    /// Show a session's processes and recent output.
    Inspect {
        /// Session ID.
        id: String,
    },

    /// Stop a session.
    Stop {
        /// Session ID.
        id: String,
    },

    /// Change a session's screen size.
    Resize {
        /// Session ID.
        id: String,
        /// New width in pixels.
        width: i64,
        /// New height in pixels.
        height: i64,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match &args.command {
        Command::Create { width, height } => {
            let mut req = serde_json::json!({ "command": "create" });
            if let Some(w) = width {
                req["width"] = serde_json::Value::from(*w);
            }
            if let Some(h) = height {
                req["height"] = serde_json::Value::from(*h);
            }
            req
        }
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Get { id } => serde_json::json!({ "command": "get", "id": id }),
        Command::Inspect { id } => serde_json::json!({ "command": "inspect", "id": id }),
        Command::Stop { id } => serde_json::json!({ "command": "stop", "id": id }),
        Command::Resize { id, width, height } => serde_json::json!({
            "command": "resize",
            "id": id,
            "width": width,
            "height": height,
        }),
    };

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    let not_found = obj
                        .get("not_found")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false);
                    std::process::exit(if not_found { 2 } else { 1 });
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is vdesk-orchestrator running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the control socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
