//! End-to-end routing behavior: queue menus, ticket lifecycle, rating flow

mod common;

use std::time::Duration;

use common::{CONTACT_JID, SentKind, inbound_text, setup};
use triage_engine::db::TicketStatus;
use triage_engine::routing::TicketUpdate;
use triage_engine::{Error, TransitionOutcome};

/// Past the default 3s debounce window
const PAST_DEBOUNCE: Duration = Duration::from_millis(3500);

#[tokio::test(start_paused = true)]
async fn single_queue_auto_assigns_without_prompts() {
    let ctx = setup().await;
    let queue = ctx.queues().create(ctx.tenant.id, "Support", "").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "hi there"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();
    assert_eq!(ticket.queue_id, Some(queue.id));
    assert!(ctx.client.sent().is_empty(), "no prompt for a single queue");
}

#[tokio::test(start_paused = true)]
async fn two_queues_numeric_reply_assigns_without_reprompt() {
    let ctx = setup().await;
    let first = ctx.queues().create(ctx.tenant.id, "Support", "Welcome to support!").unwrap();
    ctx.queues().create(ctx.tenant.id, "Sales", "Welcome to sales!").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "1"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();
    assert_eq!(ticket.queue_id, Some(first.id));

    // The queue greeting is the only send; the menu is never re-presented
    let bodies = ctx.client.sent_bodies();
    assert_eq!(bodies, vec!["Welcome to support!".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_reply_represents_menu_and_leaves_queue_unset() {
    let ctx = setup().await;
    ctx.queues().create(ctx.tenant.id, "Support", "").unwrap();
    ctx.queues().create(ctx.tenant.id, "Sales", "").unwrap();
    ctx.tenants()
        .set_messages(ctx.tenant.id, Some("Pick a department:"), None, None, None)
        .unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "9"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();
    assert!(ticket.queue_id.is_none());

    let sent = ctx.client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, SentKind::Text);
    assert!(sent[0].body.contains("Pick a department:"));
    assert!(sent[0].body.contains("*1* - Support"));
    assert!(sent[0].body.contains("*2* - Sales"));
}

#[tokio::test(start_paused = true)]
async fn menu_burst_coalesces_to_one_prompt() {
    let ctx = setup().await;
    ctx.queues().create(ctx.tenant.id, "Support", "").unwrap();
    ctx.queues().create(ctx.tenant.id, "Sales", "").unwrap();

    for i in 0..5 {
        ctx.pipeline
            .handle_message(
                ctx.tenant.id,
                inbound_text(&format!("m{i}"), CONTACT_JID, "hello??"),
            )
            .await
            .unwrap();
    }
    tokio::time::sleep(PAST_DEBOUNCE).await;

    assert_eq!(ctx.client.sent().len(), 1, "burst must produce one prompt");
}

#[tokio::test(start_paused = true)]
async fn button_mode_respects_the_ceiling() {
    let ctx = setup().await;
    ctx.settings().set(ctx.tenant.id, "chatBotType", "button").unwrap();
    for name in ["A", "B", "C", "D"] {
        ctx.queues().create(ctx.tenant.id, name, "").unwrap();
    }

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "hello"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let sent = ctx.client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, SentKind::Buttons);
    assert_eq!(sent[0].entry_count, 4);

    // A fifth queue pushes the menu over the ceiling: text fallback
    ctx.queues().create(ctx.tenant.id, "E", "").unwrap();
    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m2", CONTACT_JID, "hello again"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let sent = ctx.client.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, SentKind::Text);
}

#[tokio::test(start_paused = true)]
async fn list_mode_ignores_the_ceiling() {
    let ctx = setup().await;
    ctx.settings().set(ctx.tenant.id, "chatBotType", "list").unwrap();
    for name in ["A", "B", "C", "D", "E", "F"] {
        ctx.queues().create(ctx.tenant.id, name, "").unwrap();
    }

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "hello"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let sent = ctx.client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, SentKind::List);
    assert_eq!(sent[0].entry_count, 6);
}

#[tokio::test(start_paused = true)]
async fn queue_with_sub_options_walks_the_option_menu() {
    let ctx = setup().await;
    ctx.queues().create(ctx.tenant.id, "Sales", "").unwrap();
    let support = ctx.queues().create(ctx.tenant.id, "Support", "How can we help?").unwrap();
    ctx.queues().add_option(support.id, "Billing", "Billing details follow.").unwrap();
    ctx.queues().add_option(support.id, "Outages", "See our status page.").unwrap();

    // "2" selects Support and presents its options
    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "2"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();
    assert_eq!(ticket.queue_id, Some(support.id));
    assert!(ticket.is_bot);

    let bodies = ctx.client.sent_bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("How can we help?"));
    assert!(bodies[0].contains("*1* - Billing"));
    assert!(bodies[0].contains("Back to the main menu"));

    // "1" picks the Billing option
    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m2", CONTACT_JID, "1"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let ticket = ctx.tickets().get(ticket.id).unwrap().unwrap();
    assert!(ticket.queue_option_id.is_some());
    assert!(ctx.client.sent_bodies().contains(&"Billing details follow.".to_string()));
}

#[tokio::test(start_paused = true)]
async fn hash_returns_to_the_main_menu() {
    let ctx = setup().await;
    ctx.queues().create(ctx.tenant.id, "Sales", "").unwrap();
    let support = ctx.queues().create(ctx.tenant.id, "Support", "Support here").unwrap();
    ctx.queues().add_option(support.id, "Billing", "").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "2"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m2", CONTACT_JID, "#"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();
    assert!(ticket.queue_id.is_none());
    assert!(ticket.queue_option_id.is_none());

    // Last send is the re-presented top-level menu
    let bodies = ctx.client.sent_bodies();
    assert!(bodies.last().unwrap().contains("*1* - Sales"));
}

#[tokio::test(start_paused = true)]
async fn closing_then_new_message_reopens_the_same_ticket() {
    let ctx = setup().await;

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "help me"))
        .await
        .unwrap();

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();

    ctx.pipeline
        .transitions()
        .update(ticket.id, TicketUpdate::default().status(TicketStatus::Closed))
        .await
        .unwrap();
    assert_eq!(
        ctx.tickets().get(ticket.id).unwrap().unwrap().status,
        TicketStatus::Closed
    );

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m2", CONTACT_JID, "one more thing"))
        .await
        .unwrap();

    let reopened = ctx.tickets().get(ticket.id).unwrap().unwrap();
    assert_eq!(reopened.status, TicketStatus::Pending);
    assert_eq!(
        ctx.tickets().count_active_for_contact(ctx.tenant.id, contact.id).unwrap(),
        1,
        "reopen must never create a second ticket"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_holds_at_most_one_active_ticket() {
    let ctx = setup().await;

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let pipeline = ctx.pipeline.clone();
            let tenant_id = ctx.tenant.id;
            tokio::spawn(async move {
                pipeline
                    .handle_message(tenant_id, inbound_text(&format!("m{i}"), CONTACT_JID, "hi"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    assert_eq!(
        ctx.tickets().count_active_for_contact(ctx.tenant.id, contact.id).unwrap(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn rating_flow_clamps_and_closes() {
    let ctx = setup().await;
    ctx.settings().set(ctx.tenant.id, "userRating", "enabled").unwrap();
    ctx.tenants()
        .set_messages(ctx.tenant.id, None, Some("Thanks, goodbye!"), Some("How did we do?"), None)
        .unwrap();
    let agent = ctx.users().create("Dana").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "help"))
        .await
        .unwrap();
    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();

    ctx.pipeline
        .transitions()
        .update(
            ticket.id,
            TicketUpdate::default().status(TicketStatus::Open).agent(Some(agent.id)),
        )
        .await
        .unwrap();

    // Close request is intercepted by the rating prompt
    let outcome = ctx
        .pipeline
        .transitions()
        .update(ticket.id, TicketUpdate::default().status(TicketStatus::Closed))
        .await
        .unwrap();
    assert!(matches!(outcome, TransitionOutcome::AwaitingRating(_)));
    assert_eq!(
        ctx.tickets().get(ticket.id).unwrap().unwrap().status,
        TicketStatus::Open,
        "ticket stays in its previous status while awaiting the rating"
    );
    assert!(
        ctx.client
            .sent_bodies()
            .iter()
            .any(|b| b.contains("How did we do?") && b.contains("*1* - Unsatisfied"))
    );

    // Non-numeric reply is ignored
    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m2", CONTACT_JID, "great service"))
        .await
        .unwrap();
    assert_eq!(
        ctx.tickets().get(ticket.id).unwrap().unwrap().status,
        TicketStatus::Open
    );

    // "99" clamps to 3 and completes the close
    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m3", CONTACT_JID, "99"))
        .await
        .unwrap();

    let closed = ctx.tickets().get(ticket.id).unwrap().unwrap();
    assert_eq!(closed.status, TicketStatus::Closed);
    assert!(closed.user_id.is_none());

    let tracking = ctx.tickets().current_tracking(ticket.id, ctx.tenant.id).unwrap();
    assert!(tracking.rated);
    assert_eq!(tracking.rating, Some(3));
    assert!(tracking.finished_at.is_some());
    assert!(ctx.client.sent_bodies().contains(&"Thanks, goodbye!".to_string()));
}

#[tokio::test(start_paused = true)]
async fn second_close_after_rating_request_closes_for_real() {
    let ctx = setup().await;
    ctx.settings().set(ctx.tenant.id, "userRating", "enabled").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "help"))
        .await
        .unwrap();
    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();

    let first = ctx
        .pipeline
        .transitions()
        .update(ticket.id, TicketUpdate::default().status(TicketStatus::Closed))
        .await
        .unwrap();
    assert!(matches!(first, TransitionOutcome::AwaitingRating(_)));

    let second = ctx
        .pipeline
        .transitions()
        .update(ticket.id, TicketUpdate::default().status(TicketStatus::Closed))
        .await
        .unwrap();
    assert!(matches!(second, TransitionOutcome::Applied(_)));
    assert_eq!(
        ctx.tickets().get(ticket.id).unwrap().unwrap().status,
        TicketStatus::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn reopening_with_another_active_ticket_is_a_conflict() {
    let ctx = setup().await;
    let queue = ctx.queues().create(ctx.tenant.id, "Support", "").unwrap();
    let agent = ctx.users().create("Dana").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "hi"))
        .await
        .unwrap();
    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let old = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();

    ctx.pipeline
        .transitions()
        .update(old.id, TicketUpdate::default().status(TicketStatus::Closed))
        .await
        .unwrap();

    // A newer active ticket for the same contact
    let newer = ctx.tickets().create(ctx.tenant.id, contact.id, "whatsapp", false, 0).unwrap();
    ctx.pipeline
        .transitions()
        .update(
            newer.id,
            TicketUpdate::default().queue(Some(queue.id)).agent(Some(agent.id)),
        )
        .await
        .unwrap();

    let err = ctx
        .pipeline
        .transitions()
        .update(old.id, TicketUpdate::default().status(TicketStatus::Open).agent(Some(agent.id)))
        .await
        .unwrap_err();

    match err {
        Error::TicketConflict { queue: q, agent: a } => {
            assert_eq!(q, "Support");
            assert_eq!(a, "Dana");
        }
        other => panic!("expected TicketConflict, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn reassignment_notices_are_sent_when_msg_auto_is_on() {
    let ctx = setup().await;
    ctx.settings().set(ctx.tenant.id, "msg_auto", "enabled").unwrap();
    let q1 = ctx.queues().create(ctx.tenant.id, "Support", "").unwrap();
    let q2 = ctx.queues().create(ctx.tenant.id, "Sales", "").unwrap();
    let dana = ctx.users().create("Dana").unwrap();
    let alex = ctx.users().create("Alex").unwrap();

    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m1", CONTACT_JID, "1"))
        .await
        .unwrap();
    let contact = ctx.contacts().upsert(ctx.tenant.id, CONTACT_JID, "x", None, false).unwrap();
    let ticket = ctx.tickets().find_active_for_contact(ctx.tenant.id, contact.id).unwrap().unwrap();
    assert_eq!(ticket.queue_id, Some(q1.id));

    // Agent claims the ticket: introduction is sent
    ctx.pipeline
        .transitions()
        .update(
            ticket.id,
            TicketUpdate::default().status(TicketStatus::Open).agent(Some(dana.id)),
        )
        .await
        .unwrap();
    assert!(ctx.client.sent_bodies().iter().any(|b| b.contains("Dana")));

    // Queue transfer notice names the target queue
    ctx.pipeline
        .transitions()
        .update(ticket.id, TicketUpdate::default().queue(Some(q2.id)))
        .await
        .unwrap();
    assert!(ctx.client.sent_bodies().iter().any(|b| b.contains("Sales")));

    // Agent hand-off names both agents
    ctx.pipeline
        .transitions()
        .update(ticket.id, TicketUpdate::default().agent(Some(alex.id)))
        .await
        .unwrap();
    let bodies = ctx.client.sent_bodies();
    assert!(bodies.iter().any(|b| b.contains("Dana") && b.contains("Alex")));
}

#[tokio::test(start_paused = true)]
async fn out_of_hours_notice_is_debounced_and_not_repeated() {
    let ctx = setup().await;
    ctx.settings().set(ctx.tenant.id, "scheduleType", "company").unwrap();
    // An empty window: every instant is outside working hours
    ctx.tenants()
        .set_hours(ctx.tenant.id, Some("00:00"), Some("00:00"), "")
        .unwrap();
    ctx.tenants()
        .set_messages(ctx.tenant.id, None, None, None, Some("We are closed, back at 8am."))
        .unwrap();
    ctx.queues().create(ctx.tenant.id, "Support", "").unwrap();
    ctx.queues().create(ctx.tenant.id, "Sales", "").unwrap();

    for i in 0..3 {
        ctx.pipeline
            .handle_message(
                ctx.tenant.id,
                inbound_text(&format!("m{i}"), CONTACT_JID, "anyone there?"),
            )
            .await
            .unwrap();
    }
    tokio::time::sleep(PAST_DEBOUNCE).await;

    let bodies = ctx.client.sent_bodies();
    assert_eq!(bodies, vec!["We are closed, back at 8am.".to_string()]);

    // Another message later: the notice was already the last thing we said
    ctx.pipeline
        .handle_message(ctx.tenant.id, inbound_text("m9", CONTACT_JID, "hello??"))
        .await
        .unwrap();
    tokio::time::sleep(PAST_DEBOUNCE).await;
    assert_eq!(ctx.client.sent().len(), 1);
}
