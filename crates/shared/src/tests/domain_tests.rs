use super::*;

#[test]
fn conversation_key_is_commutative() {
    assert_eq!(conversation_key("u1", "u2"), conversation_key("u2", "u1"));
    assert_eq!(conversation_key("u1", "u2"), "u1_u2");
    assert_eq!(conversation_key("zed", "abe"), "abe_zed");
}

#[test]
fn conversation_key_is_stable_across_calls() {
    let first = conversation_key("alice", "bob");
    let second = conversation_key("alice", "bob");
    assert_eq!(first, second);
}

#[test]
fn status_moves_forward_only() {
    use MessageStatus::*;
    assert!(Pending.can_transition(Sent));
    assert!(Sent.can_transition(Delivered));
    assert!(Delivered.can_transition(Read));
    assert!(Sent.can_transition(Read));

    assert!(!Read.can_transition(Sent));
    assert!(!Delivered.can_transition(Sent));
    assert!(!Read.can_transition(Delivered));
    assert!(!Sent.can_transition(Pending));
}

#[test]
fn failed_is_reachable_only_from_pending() {
    use MessageStatus::*;
    assert!(Pending.can_transition(Failed));
    assert!(!Sent.can_transition(Failed));
    assert!(!Delivered.can_transition(Failed));
    assert!(!Read.can_transition(Failed));
    assert!(!Failed.can_transition(Sent));
}

#[test]
fn same_status_is_not_a_transition() {
    use MessageStatus::*;
    for status in [Pending, Sent, Delivered, Read, Failed, Deleted] {
        assert!(!status.can_transition(status));
    }
}

#[test]
fn iso_now_has_millisecond_precision_and_z_suffix() {
    let now = iso_now();
    assert!(now.ends_with('Z'), "missing Z suffix: {now}");
    let fractional = now.split('.').nth(1).expect("fractional part");
    assert_eq!(fractional.len(), 4, "expected .mmmZ in {now}");
}
