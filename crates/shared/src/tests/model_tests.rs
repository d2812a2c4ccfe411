use super::*;

fn remote(cdn_key: &str) -> Attachment {
    Attachment {
        cdn_key: cdn_key.to_string(),
        digest: Some("ZGlnZXN0".into()),
        key: Some("a2V5".into()),
        ..Attachment::default()
    }
}

fn message_with_everything() -> Message {
    Message {
        id: MessageId(7),
        conversation_id: ConversationId(1),
        sender: UserId(2),
        sent_at: 1_000,
        server_timestamp: 1_005,
        sequence_id: Some(3),
        notify_sequence_id: None,
        direction: MessageDirection::Incoming,
        thread_id: None,
        content: MessageContent {
            body: "hello".into(),
            long_text: Some(remote("long")),
            attachments: vec![remote("a0"), remote("a1")],
            contacts: vec![ContactCard {
                display_name: "carol".into(),
                avatar: Some(remote("avatar")),
            }],
            quote: Some(Quote {
                author: UserId(3),
                sent_at: 900,
                attachments: vec![
                    QuotedAttachment::default(),
                    QuotedAttachment {
                        content_type: Some("image/png".into()),
                        thumbnail: Some(remote("thumb")),
                    },
                ],
            }),
            group_avatar: None,
        },
        forwarded: vec![ForwardedMessage {
            forward_id: "fwd-1".into(),
            content: MessageContent {
                attachments: vec![remote("nested")],
                ..MessageContent::default()
            },
        }],
        errors: Vec::new(),
    }
}

#[test]
fn slot_lookup_follows_job_kind_and_index() {
    let message = message_with_everything();
    let content = &message.content;

    assert_eq!(
        content.slot(AttachmentJobKind::LongText, 0).map(|a| a.cdn_key.as_str()),
        Some("long")
    );
    assert_eq!(
        content.slot(AttachmentJobKind::Attachment, 1).map(|a| a.cdn_key.as_str()),
        Some("a1")
    );
    assert_eq!(
        content
            .slot(AttachmentJobKind::ContactAvatar, 0)
            .map(|a| a.cdn_key.as_str()),
        Some("avatar")
    );
    assert!(content.slot(AttachmentJobKind::QuoteThumbnail, 0).is_none());
    assert_eq!(
        content
            .slot(AttachmentJobKind::QuoteThumbnail, 1)
            .map(|a| a.cdn_key.as_str()),
        Some("thumb")
    );
    assert!(content.slot(AttachmentJobKind::GroupAvatar, 0).is_none());
    assert!(content.slot(AttachmentJobKind::Attachment, 5).is_none());
}

#[test]
fn slots_enumerates_only_occupied_positions() {
    let message = message_with_everything();
    let kinds: Vec<_> = message
        .content
        .slots()
        .into_iter()
        .map(|(kind, index, _)| (kind, index))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (AttachmentJobKind::LongText, 0),
            (AttachmentJobKind::Attachment, 0),
            (AttachmentJobKind::Attachment, 1),
            (AttachmentJobKind::ContactAvatar, 0),
            (AttachmentJobKind::QuoteThumbnail, 1),
        ]
    );
}

#[test]
fn forward_ref_addresses_nested_content() {
    let mut message = message_with_everything();
    let forward = ForwardRef {
        forward_id: "fwd-1".into(),
    };

    let nested = message
        .content_for_mut(Some(&forward))
        .expect("forwarded content")
        .slot_mut(AttachmentJobKind::Attachment, 0)
        .expect("nested slot");
    nested.path = Some("/tmp/nested".into());

    assert!(message.forwarded[0].content.attachments[0].has_local_content());
    assert!(!message.content.attachments[0].has_local_content());

    let missing = ForwardRef {
        forward_id: "unknown".into(),
    };
    assert!(message.content_for(Some(&missing)).is_none());
}

#[test]
fn decryption_material_requires_digest_and_key() {
    let mut attachment = remote("x");
    assert!(attachment.has_decryption_material());
    attachment.key = Some(String::new());
    assert!(!attachment.has_decryption_material());
    attachment.key = None;
    attachment.digest = None;
    assert!(!attachment.has_decryption_material());
}

#[test]
fn needs_download_skips_resolved_pending_and_errored_slots() {
    let mut attachment = remote("x");
    assert!(attachment.needs_download());
    attachment.pending = true;
    assert!(!attachment.needs_download());
    attachment.pending = false;
    attachment.error = true;
    assert!(!attachment.needs_download());
    attachment.error = false;
    attachment.path = Some("/data/x".into());
    assert!(!attachment.needs_download());
}

#[test]
fn conversation_ranges_require_both_bounds() {
    let mut conversation = Conversation::new(ConversationId(9), ConversationKind::Group);
    assert!(conversation.remote_range().is_none());

    conversation.oldest_remote_msg_seq_id = Some(1);
    conversation.latest_remote_msg_seq_id = Some(120);
    conversation.latest_loaded_msg_seq_id = Some(100);
    assert_eq!(
        conversation.remote_range(),
        Some(SequenceRange { start: 1, end: 120 })
    );
    assert!(conversation.loaded_range().is_none());
    assert_eq!(conversation.unloaded_backlog(), 20);
}

#[test]
fn conversation_tolerates_sparse_json() {
    let raw = r#"{"id": 4, "kind": "direct"}"#;
    let conversation: Conversation = serde_json::from_str(raw).expect("decode");
    assert_eq!(conversation.id, ConversationId(4));
    assert_eq!(conversation.unread_count, 0);
    assert!(conversation.last_read_position.is_none());
}

#[test]
fn default_quote_has_no_author_or_attachments() {
    let quote = Quote::default();
    assert_eq!(quote.author, UserId::default());
    assert!(quote.attachments.is_empty());
}
