//! Dev harness command loop: a blocking stdin reader on its own OS thread,
//! parsing operator commands and forwarding them to the async main loop
//! over an unbounded channel.
//!
//! There's no GUI or scripting console behind this yet (spec Non-goals
//! exclude the renderer), so this stdin loop is the only way to flip
//! roles, poke a point edit, or force a snapshot while exercising a node
//! by hand.

use std::io::{self, BufRead, Write};

use mapcast_core::context::Role;
use mapcast_core::document::GridKind;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub enum DevCommand {
    SetRole(Role),
    Edit {
        surface_index: usize,
        mode: GridKind,
        point_index: usize,
        nx: f32,
        ny: f32,
    },
    Snapshot,
    Peers,
    Quit,
}

fn parse_line(line: &str) -> Option<DevCommand> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "master" => Some(DevCommand::SetRole(Role::Master)),
        "peer" => Some(DevCommand::SetRole(Role::Peer)),
        "snapshot" => Some(DevCommand::Snapshot),
        "peers" => Some(DevCommand::Peers),
        "quit" | "exit" => Some(DevCommand::Quit),
        "edit" => {
            let surface_index: usize = parts.next()?.parse().ok()?;
            let mode = match parts.next()? {
                "output" => GridKind::Output,
                "source" => GridKind::Source,
                _ => return None,
            };
            let point_index: usize = parts.next()?.parse().ok()?;
            let nx: f32 = parts.next()?.parse().ok()?;
            let ny: f32 = parts.next()?.parse().ok()?;
            Some(DevCommand::Edit {
                surface_index,
                mode,
                point_index,
                nx,
                ny,
            })
        }
        _ => None,
    }
}

const HELP: &str = "commands: master | peer | edit <surface> <output|source> <point> <nx> <ny> | snapshot | peers | quit";

/// Spawn the blocking stdin reader thread. Returns immediately; sends
/// parsed commands to `tx` until stdin closes or a `quit` line arrives.
pub fn spawn(tx: UnboundedSender<DevCommand>) {
    std::thread::Builder::new()
        .name("devcli".into())
        .spawn(move || {
            println!("{HELP}");
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("devcli: stdin read failed: {}", e);
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_line(trimmed) {
                    Some(cmd) => {
                        let is_quit = cmd == DevCommand::Quit;
                        if tx.send(cmd).is_err() || is_quit {
                            break;
                        }
                    }
                    None => {
                        println!("unrecognized: {trimmed}");
                        println!("{HELP}");
                        let _ = io::stdout().flush();
                    }
                }
            }
        })
        .expect("failed to spawn devcli thread");
}
