//! # Hop Engine
//!
//! Decides, for one in-flight message, the next transmission point and
//! the rewritten message. Pure apart from read-only peeks at the flow
//! registry.
//!
//! The destination check happens *after* the hop increment, so any
//! locally delivered message shows `hop >= 1`: a receiver can always
//! tell a forwarded copy from one it minted itself.

use tracing::{debug, warn};

use crate::message::Message;
use crate::policy::PolicyValue;
use crate::registry::{self, Token};

/// One routing step.
///
/// - `(None, None)`: the message expired; drop it.
/// - `(None, Some(msg))`: no onward point; the caller decides whether
///   that means local delivery (`dst` is here) or a dead letter.
/// - `(Some(poa), Some(msg))`: transmit the rewritten message to `poa`.
pub fn hop(token: &Token, msg: Message, policy: &str) -> (Option<PolicyValue>, Option<Message>) {
    let here = token.address();

    if msg.header.hop >= msg.header.h_max {
        warn!("message {} expired at {} hops", msg.header.id, msg.header.hop);
        return (None, None);
    }

    let mut msg = msg;
    msg.header.hop += 1;
    msg.header.via = Some(here.clone());

    if msg.header.dst.as_ref() == Some(&here) {
        return (None, Some(msg));
    }

    let Some(dst) = msg.header.dst.clone() else {
        // An unaddressed message cannot be forwarded.
        return (None, Some(msg));
    };

    match next_poa(token, &dst.application, policy) {
        Some(poa) => (Some(poa), Some(msg)),
        None => {
            // Fall back on any forwarding table in scope that names the
            // destination; its via becomes the override target.
            if let Some(poa) = routed_poa(token, &dst.application, policy) {
                return (Some(poa), Some(msg));
            }
            debug!("no route for {}", dst);
            (None, Some(msg))
        }
    }
}

/// First live POA of the requested kind registered by the destination
/// application.
fn next_poa(token: &Token, application: &str, policy: &str) -> Option<PolicyValue> {
    let hops = registry::find(token, Some(application), Some(policy)).ok()?;
    hops.first().and_then(registry::inspect)
}

/// Scan forwarding tables for a rule naming the destination, then look
/// the rule's via up as the next hop instead.
fn routed_poa(token: &Token, application: &str, policy: &str) -> Option<PolicyValue> {
    let tables = registry::find(token, Some("*"), Some("application")).ok()?;
    for resource in &tables {
        let Some(PolicyValue::Application(table)) = registry::inspect(resource) else {
            continue;
        };
        if let Some(rule) = table.iter().find(|r| r.dst.application == application) {
            return next_poa(token, &rule.via.application, policy);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults;
    use crate::message::{parcel, register_builtin, Address};
    use crate::registry::{create, token, CreateRequest};
    use tempfile::TempDir;

    fn test_token(root: &TempDir, application: &str) -> Token {
        token(
            &format!("file://{}", root.path().display()),
            "test",
            application,
        )
        .unwrap()
        .unwrap()
    }

    fn udp_request() -> CreateRequest {
        CreateRequest {
            poa: vec!["udp".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_expired_message_is_dropped() {
        register_builtin();
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "sender");

        let mut msg = parcel(&tok, vec![], None, None, defaults::HOP_LIMIT);
        msg.header.hop = msg.header.h_max;

        let (poa, rewritten) = hop(&tok, msg, "udp");
        assert!(poa.is_none());
        assert!(rewritten.is_none());
    }

    #[test]
    fn test_local_delivery_after_increment() {
        register_builtin();
        let root = TempDir::new().unwrap();
        let tok = test_token(&root, "sender");

        let msg = parcel(&tok, vec![], None, None, defaults::HOP_LIMIT);
        let id = msg.header.id.clone();
        let (poa, delivered) = hop(&tok, msg, "udp");

        assert!(poa.is_none());
        let delivered = delivered.unwrap();
        assert_eq!(delivered.header.id, id);
        assert_eq!(delivered.header.hop, 1);
        assert_eq!(delivered.header.via, Some(tok.address()));
    }

    #[test]
    fn test_forward_selects_destination_poa() {
        register_builtin();
        let root = TempDir::new().unwrap();
        let sender = test_token(&root, "sender");
        let receiver = test_token(&root, "receiver");
        create(&receiver, &udp_request()).unwrap();

        let msg = parcel(
            &sender,
            vec![],
            Some(receiver.address()),
            None,
            defaults::HOP_LIMIT,
        );
        let src = msg.header.src.clone();
        let dst = msg.header.dst.clone();

        let (poa, forwarded) = hop(&sender, msg, "udp");
        let poa = poa.unwrap();
        assert!(poa.as_udp().is_some());

        // The source and destination survive the hop untouched.
        let forwarded = forwarded.unwrap();
        assert_eq!(forwarded.header.src, src);
        assert_eq!(forwarded.header.dst, dst);
        assert_eq!(forwarded.header.hop, 1);
        assert_eq!(forwarded.header.via, Some(sender.address()));
    }

    #[test]
    fn test_no_route_returns_message_unsent() {
        register_builtin();
        let root = TempDir::new().unwrap();
        let sender = test_token(&root, "sender");
        let elsewhere = Address::new("turberfield", &sender.user, "test", "nowhere");

        let msg = parcel(&sender, vec![], Some(elsewhere), None, defaults::HOP_LIMIT);
        let (poa, rewritten) = hop(&sender, msg, "udp");
        assert!(poa.is_none());
        assert!(rewritten.is_some());
    }

    #[test]
    fn test_forwarding_table_supplies_via() {
        register_builtin();
        let root = TempDir::new().unwrap();
        let sender = test_token(&root, "sender");
        let hub = test_token(&root, "hub");
        create(&hub, &udp_request()).unwrap();

        // The destination has no POA of its own; a table routes it
        // through the hub.
        let request = CreateRequest {
            routing: vec!["application".to_string()],
            ..Default::default()
        };
        let resources = create(&sender, &request).unwrap();
        let routes = resources[0].as_ref().unwrap();
        let mut table = registry::inspect(routes)
            .unwrap()
            .as_table()
            .unwrap()
            .clone();
        let rule = crate::policy::Rule {
            src: sender.address(),
            dst: Address::new("turberfield", &sender.user, "test", "receiver"),
            h_max: 1,
            via: hub.address(),
        };
        table.replace(&rule.src, &rule.dst, Some(rule.clone()));
        registry::replace(routes, &PolicyValue::Application(table)).unwrap();

        let msg = parcel(
            &sender,
            vec![],
            Some(rule.dst.clone()),
            None,
            defaults::HOP_LIMIT,
        );
        let (poa, _) = hop(&sender, msg, "udp");
        let hub_poa = registry::find(&sender, Some("hub"), Some("udp"))
            .unwrap()
            .first()
            .and_then(registry::inspect)
            .unwrap();
        assert_eq!(poa, Some(hub_poa));
    }
}
