//! IPC command sender.
//!
//! Sends one `from_gui;ipc_command;...` datagram to a beacond server on the
//! same machine. Exit codes: 0 on success, 1 when help was shown, -1 on any
//! error.

use std::net::UdpSocket;
use std::process::exit;

use clap::Parser;

use beacond::wire::{self, PktDirection, PktType};

/// This tool only talks to a server installed on the same machine.
const LOCAL_SERVER_IP: &str = "127.0.0.1";

const CMD_RELOAD_GEO_FENCE_SETTING: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "beacond-ipc")]
#[command(about = "Send IPC commands to a local beacond server")]
struct Args {
    /// Listening port of the destination server
    #[arg(short = 'p', value_name = "PORT")]
    port: u16,

    /// IPC command; the supported value is cmd_reload_geo_fence_setting
    #[arg(short = 'c', value_name = "CMD")]
    command: String,

    /// Settings to reload: geofence_all, geofence_list or geofence_object
    #[arg(short = 'r', value_name = "RELOAD")]
    reload: Option<String>,

    /// Whether to reload all covered areas (area_all) or one (area_one)
    #[arg(short = 'f', value_name = "SCOPE")]
    scope: Option<String>,

    /// Area id to reload, required with area_one
    #[arg(short = 'a', value_name = "AREA_ID")]
    area_id: Option<u32>,

    /// Print the datagram before sending it
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn build_message(args: &Args) -> Result<String, String> {
    if args.command != "cmd_reload_geo_fence_setting" {
        return Err(format!(
            "unsupported command [{}], use option -h to see the usage",
            args.command
        ));
    }

    let reload_kind = match args.reload.as_deref() {
        Some("geofence_all") => 1,
        Some("geofence_list") => 2,
        Some("geofence_object") => 3,
        other => {
            return Err(format!(
                "invalid or missing reload setting [{}], use option -h to see the usage",
                other.unwrap_or("")
            ));
        }
    };

    let body = match args.scope.as_deref() {
        Some("area_all") => format!("{CMD_RELOAD_GEO_FENCE_SETTING};{reload_kind};1;"),
        Some("area_one") => match args.area_id {
            Some(area_id) if area_id > 0 => {
                format!("{CMD_RELOAD_GEO_FENCE_SETTING};{reload_kind};2;{area_id};")
            }
            _ => {
                return Err(
                    "area_one requires a positive area id via option -a".to_string(),
                );
            }
        },
        other => {
            return Err(format!(
                "invalid or missing area scope [{}], use option -h to see the usage",
                other.unwrap_or("")
            ));
        }
    };

    Ok(format!(
        "{}{}",
        wire::format_header(PktDirection::FromGui, PktType::IpcCommand),
        body
    ))
}

fn run(args: &Args) -> Result<(), String> {
    let message = build_message(args)?;
    if args.verbose {
        println!("sending [{message}]");
    }

    let socket =
        UdpSocket::bind("0.0.0.0:0").map_err(|err| format!("failed to open socket: {err}"))?;
    socket
        .send_to(message.as_bytes(), (LOCAL_SERVER_IP, args.port))
        .map_err(|err| format!("failed to send command: {err}"))?;

    println!("command sent to {LOCAL_SERVER_IP}:{}", args.port);
    Ok(())
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp => {
            let _ = err.print();
            exit(1);
        }
        Err(err) => {
            let _ = err.print();
            exit(-1);
        }
    };

    match run(&args) {
        Ok(()) => exit(0),
        Err(message) => {
            eprintln!("{message}");
            exit(-1);
        }
    }
}
