//! Delivery of encoded frames to sessions in the roster.
//!
//! All primitives take the roster lock for the whole fan-out, so a
//! broadcast reaches exactly the membership present when it started.
//! Fan-out is best-effort: a failed write to one target is logged and
//! skipped, and that target's own handler tears it down when its read
//! side fails.

use crate::registry::{Registry, Roster};
use crate::uid::Uid;
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

/// Delivery errors
#[derive(Debug)]
pub enum RelayError {
    /// No live session holds this uid.
    Unreachable(Uid),
    /// Write to the session's connection failed.
    Io(Uid, std::io::Error),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Unreachable(uid) => write!(f, "Session {} is gone", uid),
            RelayError::Io(uid, e) => write!(f, "Write to session {} failed: {}", uid, e),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Io(_, e) => Some(e),
            RelayError::Unreachable(_) => None,
        }
    }
}

/// Outcome of a fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: Vec<Uid>,
}

/// Write `frame` to every session but `skip` through a held roster guard.
pub(crate) async fn fan_out(roster: &mut Roster, frame: &[u8], skip: Option<Uid>) -> Delivery {
    let mut delivery = Delivery::default();

    for session in roster.iter_mut() {
        if Some(session.uid) == skip {
            continue;
        }
        match session.writer.write_all(frame).await {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                warn!(uid = session.uid, error = %e, "Fan-out write failed");
                delivery.failed.push(session.uid);
            }
        }
    }

    delivery
}

/// Send `frame` to every registered session.
pub async fn broadcast(registry: &Registry, frame: &[u8]) -> Delivery {
    let mut roster = registry.lock().await;
    let delivery = fan_out(&mut roster, frame, None).await;
    trace!(delivered = delivery.delivered, "Broadcast");
    delivery
}

/// Send `frame` to every registered session except `uid`.
pub async fn unicast_except(registry: &Registry, frame: &[u8], uid: Uid) -> Delivery {
    let mut roster = registry.lock().await;
    let delivery = fan_out(&mut roster, frame, Some(uid)).await;
    trace!(from = uid, delivered = delivery.delivered, "Broadcast to others");
    delivery
}

/// Write `frame` to `uid` through a held roster guard.
pub(crate) async fn deliver(roster: &mut Roster, frame: &[u8], uid: Uid) -> Result<(), RelayError> {
    let session = roster.get_mut(uid).ok_or(RelayError::Unreachable(uid))?;
    session
        .writer
        .write_all(frame)
        .await
        .map_err(|e| RelayError::Io(uid, e))
}

/// [`unicast`] through a held roster guard.
pub(crate) async fn unicast_in(roster: &mut Roster, frame: &[u8], uid: Uid) {
    match deliver(roster, frame, uid).await {
        Ok(()) => trace!(to = uid, "Unicast"),
        Err(RelayError::Unreachable(_)) => trace!(to = uid, "Unicast target gone"),
        Err(e) => warn!(error = %e, "Unicast failed"),
    }
}

/// Send `frame` to the session holding `uid`.
pub async fn send_to(registry: &Registry, frame: &[u8], uid: Uid) -> Result<(), RelayError> {
    let mut roster = registry.lock().await;
    deliver(&mut roster, frame, uid).await
}

/// Send `frame` to `uid` if it is still connected. A missing or failing
/// target is not an error for the sender.
pub async fn unicast(registry: &Registry, frame: &[u8], uid: Uid) {
    let mut roster = registry.lock().await;
    unicast_in(&mut roster, frame, uid).await;
}

/// Send `frame` on the caller's own connection. Failure is fatal to the
/// caller.
pub async fn reply(registry: &Registry, frame: &[u8], uid: Uid) -> Result<(), RelayError> {
    send_to(registry, frame, uid).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, message};
    use crate::session::Session;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn join(registry: &Registry, uid: Uid) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        registry
            .add(Session::new(uid, addr(), Box::new(server)))
            .await
            .unwrap();
        client
    }

    async fn read_text(client: &mut DuplexStream) -> String {
        let mut header = [0u8; 3];
        client.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(3 + len, 0);
        client.read_exact(&mut frame[3..]).await.unwrap();
        String::from_utf8(decode(&frame).unwrap().payload.to_vec()).unwrap()
    }

    /// Confirm nothing is pending by writing a marker through the same pipe.
    async fn assert_idle(registry: &Registry, client: &mut DuplexStream, uid: Uid) {
        send_to(registry, &message("marker").unwrap(), uid).await.unwrap();
        assert_eq!(read_text(client).await, "marker");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = Registry::new(4);
        let mut a = join(&registry, 10).await;
        let mut b = join(&registry, 11).await;

        let delivery = broadcast(&registry, &message("hello\r\n").unwrap()).await;
        assert_eq!(delivery.delivered, 2);
        assert!(delivery.failed.is_empty());
        assert_eq!(read_text(&mut a).await, "hello\r\n");
        assert_eq!(read_text(&mut b).await, "hello\r\n");
    }

    #[tokio::test]
    async fn test_unicast_except_skips_sender() {
        let registry = Registry::new(4);
        let mut a = join(&registry, 10).await;
        let mut b = join(&registry, 11).await;
        let mut c = join(&registry, 12).await;

        let delivery = unicast_except(&registry, &message("[10] hi\r\n").unwrap(), 10).await;
        assert_eq!(delivery.delivered, 2);
        assert_eq!(read_text(&mut b).await, "[10] hi\r\n");
        assert_eq!(read_text(&mut c).await, "[10] hi\r\n");
        assert_idle(&registry, &mut a, 10).await;
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_failed_target() {
        let registry = Registry::new(4);
        let a = join(&registry, 10).await;
        let mut b = join(&registry, 11).await;
        drop(a);

        let delivery = broadcast(&registry, &message("still here\r\n").unwrap()).await;
        assert_eq!(delivery.failed, vec![10]);
        assert_eq!(delivery.delivered, 1);
        assert_eq!(read_text(&mut b).await, "still here\r\n");
    }

    #[tokio::test]
    async fn test_unicast_to_missing_uid_is_silent() {
        let registry = Registry::new(4);
        let mut a = join(&registry, 10).await;

        unicast(&registry, &message("nobody\r\n").unwrap(), 99).await;
        unicast(&registry, &message("you\r\n").unwrap(), 10).await;
        assert_eq!(read_text(&mut a).await, "you\r\n");
    }

    #[tokio::test]
    async fn test_reply_failure_is_reported() {
        let registry = Registry::new(4);
        let a = join(&registry, 10).await;
        drop(a);

        let err = reply(&registry, &message("x").unwrap(), 10).await.unwrap_err();
        assert!(matches!(err, RelayError::Io(10, _)));

        let err = reply(&registry, &message("x").unwrap(), 11).await.unwrap_err();
        assert!(matches!(err, RelayError::Unreachable(11)));
    }

    /// Join `members`, drop the ones marked as departed, then send one line
    /// to everyone but `excluded`. Returns who got it, in uid order.
    async fn except_round(members: &BTreeMap<Uid, bool>, excluded: Uid) -> (Delivery, Vec<Uid>) {
        let registry = Registry::new(members.len());
        let mut clients = Vec::new();
        for (&uid, &stays) in members {
            clients.push((uid, stays, join(&registry, uid).await));
        }
        for (uid, stays, _) in &clients {
            if !stays {
                registry.remove(*uid).await;
            }
        }

        let delivery = unicast_except(&registry, &message("hi").unwrap(), excluded).await;

        let mut reached = Vec::new();
        for (uid, _, client) in clients.iter_mut().filter(|(_, stays, _)| *stays) {
            send_to(&registry, &message("marker").unwrap(), *uid).await.unwrap();
            if read_text(client).await == "hi" {
                reached.push(*uid);
                assert_eq!(read_text(client).await, "marker");
            }
        }
        (delivery, reached)
    }

    proptest! {
        #[test]
        fn prop_unicast_except_skips_exactly_one(
            members in prop::collection::btree_map(10u32..60, any::<bool>(), 1..12),
            pick in any::<prop::sample::Index>(),
        ) {
            let uids: Vec<Uid> = members.keys().copied().collect();
            let excluded = uids[pick.index(uids.len())];

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (delivery, reached) = runtime.block_on(except_round(&members, excluded));

            let expected: Vec<Uid> = members
                .iter()
                .filter(|&(&uid, &stays)| stays && uid != excluded)
                .map(|(&uid, _)| uid)
                .collect();
            prop_assert_eq!(delivery.delivered, expected.len());
            prop_assert!(delivery.failed.is_empty());
            prop_assert_eq!(reached, expected);
        }
    }
}
