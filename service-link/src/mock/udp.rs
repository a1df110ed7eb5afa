//! Mock UDP endpoint; clients are keyed by peer address

use super::{Link, Shared};
use crate::packet::is_would_block;
use crate::protocol::Opcode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub(super) fn serve(shared: Arc<Shared>) {
    let mut buf = [0u8; 1024];

    while shared.running.load(Ordering::Relaxed) {
        let (n, peer) = match shared.udp.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e) if is_would_block(e) => continue,
            Err(e) => {
                // ICMP errors from departed peers surface here on some platforms
                log::debug!("Mock UDP receive error: {}", e);
                continue;
            }
        };
        let Some((&code, rest)) = buf[..n].split_first() else {
            continue;
        };

        let known = shared.udp_peers.lock().get(&peer).copied();
        let id = match known {
            Some(id) => id,
            // A departing peer's GOODBYE must not resurrect it
            None if code == Opcode::Goodbye.as_byte() => continue,
            None => {
                let id = shared.add_client(Link::Udp(peer));
                shared.udp_peers.lock().insert(peer, id);
                log::debug!("Mock UDP client {} from {}", id, peer);
                id
            }
        };

        let name = (code == Opcode::Subscribe.as_byte()).then(|| {
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).into_owned()
        });

        if !shared.handle_control(id, code, name.as_deref()) {
            shared.drop_client(id);
        }
    }
}
