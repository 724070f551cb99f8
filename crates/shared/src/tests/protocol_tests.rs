use super::*;
use serde_json::json;

#[test]
fn message_dto_round_trips_with_wire_field_names() {
    let raw = json!({
        "messageId": "id-abc1234",
        "chatId": "u1_u2",
        "senderId": "u1",
        "recipientId": "u2",
        "content": "hello",
        "timestamp": "2025-01-01T10:00:00.000Z",
        "status": "SENT",
        "type": "TEXT"
    });
    let dto: MessageDto = serde_json::from_value(raw).expect("decode");
    assert_eq!(dto.message_id, "id-abc1234");
    assert_eq!(dto.status, MessageStatus::Sent);
    assert_eq!(dto.kind, MessageKind::Text);

    let encoded = serde_json::to_value(&dto).expect("encode");
    assert_eq!(encoded["messageId"], "id-abc1234");
    assert_eq!(encoded["type"], "TEXT");
}

#[test]
fn message_dto_defaults_kind_to_text() {
    let raw = json!({
        "messageId": "m1",
        "senderId": "u1",
        "content": "x",
        "timestamp": "2025-01-01T10:00:00.000Z",
        "status": "DELIVERED"
    });
    let dto: MessageDto = serde_json::from_value(raw).expect("decode");
    assert_eq!(dto.kind, MessageKind::Text);
    assert!(dto.chat_id.is_none());
}

#[test]
fn conversation_participants_accept_strings_and_objects() {
    let raw = json!({
        "chatId": "u1_u2",
        "participants": [
            "u1",
            { "userId": "u2", "name": "Bea", "profilePictureUrl": "http://x/p.png" }
        ],
        "unreadCounts": { "u1": 2 },
        "updatedAt": "2025-01-01T10:00:00.000Z"
    });
    let dto: ConversationDto = serde_json::from_value(raw).expect("decode");
    assert_eq!(dto.participants.len(), 2);
    assert_eq!(dto.participants[0].user_id, "u1");
    assert_eq!(dto.participants[0].name, "User");
    assert_eq!(dto.participants[1].name, "Bea");
}

#[test]
fn decode_dispatches_on_topic() {
    let event = ChatEvent::decode(
        TOPIC_PRESENCE,
        json!({ "userId": "u3", "status": "online" }),
    )
    .expect("decode");
    match event {
        ChatEvent::Presence(presence) => assert!(presence.is_online()),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn decode_maps_unrecognized_topics_to_unknown() {
    let event = ChatEvent::decode("/user/queue/reactions", json!({ "emoji": "+1" }))
        .expect("decode");
    match event {
        ChatEvent::Unknown { topic } => assert_eq!(topic, "/user/queue/reactions"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn decode_surfaces_malformed_payloads_as_errors() {
    let result = ChatEvent::decode(TOPIC_MESSAGES, json!({ "messageId": 42 }));
    assert!(result.is_err());
}
