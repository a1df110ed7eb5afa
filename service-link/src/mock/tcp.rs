//! Mock TCP listener and per-client readers

use super::{Link, POLL_TIMEOUT, Shared};
use crate::packet::is_would_block;
use crate::protocol::Opcode;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

pub(super) fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while shared.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = spawn_reader(&shared, stream) {
                    log::warn!("Mock could not serve {}: {}", peer, e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                log::warn!("Mock accept failed: {}", e);
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

fn spawn_reader(shared: &Arc<Shared>, stream: TcpStream) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_TIMEOUT))?;
    let writer = stream.try_clone()?;
    let id = shared.add_client(Link::Tcp(writer));
    log::debug!("Mock TCP client {} from {:?}", id, stream.peer_addr());

    let reader_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("mock-tcp-{}", id))
        .spawn(move || read_loop(reader_shared, id, stream))?;
    Ok(())
}

fn read_loop(shared: Arc<Shared>, id: u64, mut stream: TcpStream) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 256];

    while shared.running.load(Ordering::Relaxed) && shared.clients.lock().contains_key(&id) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(ref e) if is_would_block(e) => continue,
            Err(_) => break,
        }

        if !process(&shared, id, &mut pending) {
            break;
        }
    }
    shared.drop_client(id);
}

/// Handle every complete control message in `pending`
fn process(shared: &Shared, id: u64, pending: &mut Vec<u8>) -> bool {
    while let Some(&code) = pending.first() {
        let consumed = if code == Opcode::Subscribe.as_byte() {
            let Some(nul) = pending.iter().skip(1).position(|&b| b == 0) else {
                // Name still arriving
                return true;
            };
            let name = String::from_utf8_lossy(&pending[1..1 + nul]).into_owned();
            if !shared.handle_control(id, code, Some(&name)) {
                return false;
            }
            nul + 2
        } else {
            if !shared.handle_control(id, code, None) {
                return false;
            }
            1
        };
        pending.drain(..consumed);
    }
    true
}
