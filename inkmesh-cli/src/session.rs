//! Interactive session: stdin commands in, mesh events out.

use std::collections::HashSet;

use inkmesh_collab::{MeshEvent, MeshHandle, PeerAddress};
use inkmesh_core::Stroke;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::commands::{self, Command, HELP};

const DEFAULT_WIDTH: f64 = 3.0;

pub async fn run(
    handle: MeshHandle,
    mut events: UnboundedReceiver<MeshEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!(
        "room {} ({:?}), share the id to invite others. `help` lists commands.",
        handle.room_id(),
        handle.role()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut present: HashSet<PeerAddress> = HashSet::new();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match commands::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => execute(&handle, command).await?,
                    Err(e) => println!("error: {e}"),
                }
            }
            event = events.recv() => match event {
                Some(event) => print_event(&event, &mut present),
                None => break,
            },
        }
    }

    handle.destroy().await;
    Ok(())
}

async fn execute(
    handle: &MeshHandle,
    command: Command,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match command {
        Command::Line {
            from,
            to,
            color,
            width,
        } => {
            let color = color.unwrap_or_else(|| handle.identity().color.clone());
            let stroke = Stroke::line(from, to, color, width.unwrap_or(DEFAULT_WIDTH));
            println!("drew {}", stroke.id);
            handle.send_stroke(stroke).await?;
        }
        Command::Erase(ids) => handle.send_erase(ids).await?,
        Command::Cursor { x, y } => handle.send_cursor(x, y).await?,
        Command::Clear => handle.send_clear_all().await?,
        Command::Peers => {
            let peers = handle.peers().await?;
            println!("{} peer(s)", peers.len());
            for peer in peers {
                println!("  {} {} ({})", peer.address, peer.username, peer.color);
            }
        }
        Command::Cursors => {
            let cursors = handle.cursors().await?;
            println!("{} cursor(s)", cursors.len());
            for (address, cursor) in cursors {
                println!(
                    "  {} ({address}) at ({:.1}, {:.1})",
                    cursor.identity.username, cursor.position.x, cursor.position.y
                );
            }
        }
        Command::Strokes => {
            let strokes = handle.snapshot().await?;
            println!("{} stroke(s)", strokes.len());
            for stroke in strokes {
                println!(
                    "  {} {:?} {} w={} points={}",
                    stroke.id,
                    stroke.tool,
                    stroke.color,
                    stroke.width,
                    stroke.points.len()
                );
            }
        }
        Command::Stats => println!("{:#?}", handle.stats().await?),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

/// `present` tracks who is connected, so identity refreshes of a known
/// peer print differently from a join.
fn print_event(event: &MeshEvent, present: &mut HashSet<PeerAddress>) {
    match event {
        MeshEvent::PeerConnected { address, identity } => {
            if present.insert(address.clone()) {
                println!("+ {} joined ({address})", identity.username)
            } else {
                println!("~ {address} is {}", identity.username)
            }
        }
        MeshEvent::PeerDisconnected { address, username } => {
            present.remove(address);
            println!("- {username} left ({address})")
        }
        MeshEvent::StrokeReceived(stroke) => {
            println!("stroke {} ({} points)", stroke.id, stroke.points.len())
        }
        MeshEvent::StrokesErased(ids) => {
            let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
            println!("erased {}", ids.join(" "))
        }
        MeshEvent::CursorUpdate {
            x, y, identity, ..
        } => log::debug!("cursor {} at ({x:.1}, {y:.1})", identity.username),
        MeshEvent::SyncData(strokes) => println!("synced {} stroke(s)", strokes.len()),
        MeshEvent::ClearAll => println!("canvas cleared"),
        MeshEvent::Error(message) => println!("error: {message}"),
    }
}
