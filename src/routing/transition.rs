//! Ticket lifecycle transitions
//!
//! Applies status, queue, and agent changes with their mandated side
//! effects: tracking milestones, automated notices, the rating flow with its
//! close short-circuit, and the duplicate-open-ticket conflict check that
//! guards reopening. Notification-send failures are logged and never roll
//! back the transition that triggered them.

use chrono::Utc;

use crate::db::{
    Contact, ContactRepo, DbPool, MessageRepo, QueueRepo, SettingsRepo, Tenant, TenantRepo,
    Ticket, TicketRepo, TicketStatus, UserRepo,
};
use crate::events::{EventBus, EventKind};
use crate::pipeline::outbound::OutboundDispatcher;
use crate::{Error, Result};

/// Fixed rating scale appended to the tenant's rating template
const RATING_SCALE: &str =
    "Rate our support from 1 to 3:\n*1* - Unsatisfied\n*2* - Satisfied\n*3* - Very satisfied";

/// Fields to change on a ticket; `None` leaves a field untouched, while the
/// inner `Option` distinguishes "assign" from "clear"
#[derive(Debug, Clone, Copy, Default)]
pub struct TicketUpdate {
    pub status: Option<TicketStatus>,
    pub queue_id: Option<Option<i64>>,
    pub user_id: Option<Option<i64>>,
    pub is_bot: Option<bool>,
    pub queue_option_id: Option<Option<i64>>,
}

impl TicketUpdate {
    /// Change the status
    #[must_use]
    pub const fn status(mut self, status: TicketStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Assign or clear the queue
    #[must_use]
    pub const fn queue(mut self, queue_id: Option<i64>) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    /// Assign or clear the agent
    #[must_use]
    pub const fn agent(mut self, user_id: Option<i64>) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set the bot-driven flag
    #[must_use]
    pub const fn bot(mut self, is_bot: bool) -> Self {
        self.is_bot = Some(is_bot);
        self
    }

    /// Set or clear the selected chatbot-option marker
    #[must_use]
    pub const fn option(mut self, queue_option_id: Option<i64>) -> Self {
        self.queue_option_id = Some(queue_option_id);
        self
    }
}

/// Result of a transition request
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The update was applied
    Applied(Ticket),
    /// A close was intercepted by the rating prompt; the ticket stays in
    /// its previous status until a rating reply arrives
    AwaitingRating(Ticket),
}

impl TransitionOutcome {
    /// The ticket as of this outcome
    #[must_use]
    pub const fn ticket(&self) -> &Ticket {
        match self {
            Self::Applied(ticket) | Self::AwaitingRating(ticket) => ticket,
        }
    }
}

/// Ticket state machine
pub struct TicketTransitions {
    db: DbPool,
    bus: EventBus,
    outbound: OutboundDispatcher,
}

impl TicketTransitions {
    /// Create the state machine
    #[must_use]
    pub const fn new(db: DbPool, bus: EventBus, outbound: OutboundDispatcher) -> Self {
        Self { db, bus, outbound }
    }

    /// Apply a transition with its side effects
    ///
    /// # Errors
    ///
    /// Returns [`Error::TicketConflict`] when a reopen would collide with
    /// another active ticket, or a persistence error.
    pub async fn update(&self, ticket_id: i64, update: TicketUpdate) -> Result<TransitionOutcome> {
        let tickets = TicketRepo::new(self.db.clone());
        let ticket = tickets
            .get(ticket_id)?
            .ok_or_else(|| Error::NotFound(format!("ticket {ticket_id}")))?;
        let tenant = TenantRepo::new(self.db.clone())
            .get(ticket.tenant_id)?
            .ok_or_else(|| Error::NotFound(format!("tenant {}", ticket.tenant_id)))?;
        let contact = ContactRepo::new(self.db.clone())
            .get(ticket.contact_id)?
            .ok_or_else(|| Error::NotFound(format!("contact {}", ticket.contact_id)))?;
        let settings = SettingsRepo::new(self.db.clone()).load(ticket.tenant_id)?;
        let mut tracking = tickets.current_tracking(ticket.id, ticket.tenant_id)?;

        // An agent-driven update counts as having seen the conversation
        MessageRepo::new(self.db.clone()).mark_ticket_read(ticket.id)?;
        tickets.clear_unread(ticket.id)?;

        let old_status = ticket.status;
        let old_queue = ticket.queue_id;
        let old_user = ticket.user_id;

        let new_status = update.status.unwrap_or(old_status);
        let mut new_queue = update.queue_id.unwrap_or(old_queue);
        let mut new_user = update.user_id.unwrap_or(old_user);
        let mut new_is_bot = update.is_bot.unwrap_or(ticket.is_bot);
        let mut new_option = update.queue_option_id.unwrap_or(ticket.queue_option_id);

        // Reopening semantics: a closed ticket sheds its bot state, and the
        // contact must not already hold another active ticket
        if old_status == TicketStatus::Closed {
            self.check_contact_conflict(&ticket)?;
            new_is_bot = false;
            new_option = None;
        }

        let now = Utc::now();

        if update.status == Some(TicketStatus::Closed) {
            if settings.user_rating && tracking.rating_at.is_none() {
                // Rating prompt short-circuit: ask for the rating, stamp the
                // request, and keep the ticket in its current status until a
                // numeric reply arrives
                let prompt = rating_prompt(tenant.rating_message.as_deref());
                if let Err(e) = self.outbound.send_text(&ticket, &contact, &prompt).await {
                    tracing::warn!(ticket_id, error = %e, "rating prompt send failed");
                }

                tracking.rating_at = Some(now);
                tracking.rated = false;
                tickets.save_tracking(&tracking)?;

                self.bus.emit(EventKind::TicketRemoved {
                    tenant_id: ticket.tenant_id,
                    ticket_id,
                    room: old_status,
                });
                return Ok(TransitionOutcome::AwaitingRating(ticket));
            }

            self.send_closing_messages(&tenant, &settings, &ticket, &contact).await;

            tracking.finished_at = Some(now);
            tracking.user_id = new_user.or(old_user);
            new_queue = None;
            new_user = None;
        }

        if let Some(Some(_)) = update.queue_id {
            tracking.queued_at = Some(now);
        }

        self.send_reassignment_notices(
            &settings, &ticket, &contact, old_queue, new_queue, old_user, new_user,
        )
        .await;

        tickets.apply(ticket_id, new_status, new_queue, new_user, new_is_bot, new_option)?;

        // Milestones are stamped only for explicitly requested status moves
        match update.status {
            Some(TicketStatus::Pending) => {
                tracking.queued_at = Some(now);
                tracking.started_at = None;
                tracking.user_id = None;
            }
            Some(TicketStatus::Open) => {
                tracking.started_at = Some(now);
                tracking.rating_at = None;
                tracking.rated = false;
                tracking.user_id = new_user;

                if old_status != TicketStatus::Open {
                    self.send_agent_introduction(&tenant, &settings, &ticket, &contact, new_user)
                        .await;
                }
            }
            Some(TicketStatus::Closed) | None => {}
        }
        tickets.save_tracking(&tracking)?;

        let updated = tickets
            .get(ticket_id)?
            .ok_or_else(|| Error::Database("ticket vanished".to_string()))?;

        if updated.status != old_status || updated.user_id != old_user {
            self.bus.emit(EventKind::TicketRemoved {
                tenant_id: updated.tenant_id,
                ticket_id,
                room: old_status,
            });
        }
        self.bus.emit(EventKind::TicketUpdated {
            tenant_id: updated.tenant_id,
            ticket_id,
            status: updated.status,
        });

        Ok(TransitionOutcome::Applied(updated))
    }

    /// Process a contact's reply while the ticket awaits a rating
    ///
    /// Numeric replies are clamped into 1..=3 and complete the close;
    /// anything else is ignored and the ticket keeps waiting.
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails
    pub async fn handle_rating(&self, ticket: &Ticket, body: &str) -> Result<bool> {
        let Some(value) = parse_rating(body) else {
            tracing::debug!(ticket_id = ticket.id, "non-numeric rating reply ignored");
            return Ok(false);
        };
        let rating = value.clamp(1, 3);

        let tickets = TicketRepo::new(self.db.clone());
        let mut tracking = tickets.current_tracking(ticket.id, ticket.tenant_id)?;
        tracking.rated = true;
        tracking.rating = Some(rating);
        tracking.finished_at = Some(Utc::now());
        tickets.save_tracking(&tracking)?;

        let tenant = TenantRepo::new(self.db.clone())
            .get(ticket.tenant_id)?
            .ok_or_else(|| Error::NotFound(format!("tenant {}", ticket.tenant_id)))?;
        let contact = ContactRepo::new(self.db.clone())
            .get(ticket.contact_id)?
            .ok_or_else(|| Error::NotFound(format!("contact {}", ticket.contact_id)))?;

        if let Some(completion) = non_empty(tenant.completion_message.as_deref()) {
            if let Err(e) = self.outbound.send_text(ticket, &contact, completion).await {
                tracing::warn!(ticket_id = ticket.id, error = %e, "completion message send failed");
            }
        }

        let old_status = ticket.status;
        tickets.apply(ticket.id, TicketStatus::Closed, None, None, false, None)?;

        self.bus.emit(EventKind::TicketRemoved {
            tenant_id: ticket.tenant_id,
            ticket_id: ticket.id,
            room: old_status,
        });
        self.bus.emit(EventKind::TicketUpdated {
            tenant_id: ticket.tenant_id,
            ticket_id: ticket.id,
            status: TicketStatus::Closed,
        });

        tracing::info!(ticket_id = ticket.id, rating, "ticket rated and closed");
        Ok(true)
    }

    /// Reject reopening when the contact already holds another active ticket
    fn check_contact_conflict(&self, ticket: &Ticket) -> Result<()> {
        let tickets = TicketRepo::new(self.db.clone());
        let Some(active) = tickets.find_active_for_contact(ticket.tenant_id, ticket.contact_id)?
        else {
            return Ok(());
        };
        if active.id == ticket.id {
            return Ok(());
        }

        let queue = active
            .queue_id
            .map(|id| QueueRepo::new(self.db.clone()).get(id))
            .transpose()?
            .flatten()
            .map_or_else(|| "-".to_string(), |q| q.name);
        let agent = UserRepo::new(self.db.clone()).display_name(active.user_id)?;

        Err(Error::TicketConflict { queue, agent })
    }

    async fn send_closing_messages(
        &self,
        tenant: &Tenant,
        settings: &crate::db::Settings,
        ticket: &Ticket,
        contact: &Contact,
    ) {
        let Some(completion) = non_empty(tenant.completion_message.as_deref()) else {
            return;
        };

        if let Err(e) = self.outbound.send_text(ticket, contact, completion).await {
            tracing::warn!(ticket_id = ticket.id, error = %e, "completion message send failed");
        }

        if settings.msg_auto {
            let agent = self.agent_name(ticket.user_id);
            let notice = format!("*Automated message:*\n{agent} has closed the conversation.");
            if let Err(e) = self.outbound.send_text(ticket, contact, &notice).await {
                tracing::warn!(ticket_id = ticket.id, error = %e, "closing notice send failed");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_reassignment_notices(
        &self,
        settings: &crate::db::Settings,
        ticket: &Ticket,
        contact: &Contact,
        old_queue: Option<i64>,
        new_queue: Option<i64>,
        old_user: Option<i64>,
        new_user: Option<i64>,
    ) {
        if let (Some(old_q), Some(new_q)) = (old_queue, new_queue) {
            if old_q != new_q {
                if !settings.msg_auto {
                    return;
                }
                let queue_name = QueueRepo::new(self.db.clone())
                    .get(new_q)
                    .ok()
                    .flatten()
                    .map_or_else(|| "-".to_string(), |q| q.name);
                let agent = self.agent_name(old_user);
                let notice = format!(
                    "*Automated message:*\n{agent} transferred you to the *{queue_name}* queue, please wait for the next available agent."
                );
                if let Err(e) = self.outbound.send_text(ticket, contact, &notice).await {
                    tracing::warn!(ticket_id = ticket.id, error = %e, "queue transfer notice send failed");
                }
                return;
            }
        }

        if let (Some(old_u), Some(new_u)) = (old_user, new_user) {
            if old_u != new_u {
                if settings.msg_auto {
                    let old_name = self.agent_name(Some(old_u));
                    let new_name = self.agent_name(Some(new_u));
                    let handoff = format!(
                        "*Automated message:*\n*{old_name}* handed your conversation over to *{new_name}*."
                    );
                    if let Err(e) = self.outbound.send_text(ticket, contact, &handoff).await {
                        tracing::warn!(ticket_id = ticket.id, error = %e, "hand-off notice send failed");
                    }
                    let started = format!("*Automated message:*\n{new_name} is now attending you.");
                    if let Err(e) = self.outbound.send_text(ticket, contact, &started).await {
                        tracing::warn!(ticket_id = ticket.id, error = %e, "hand-off notice send failed");
                    }
                } else {
                    let notice = "You were transferred; we will be with you shortly.";
                    if let Err(e) = self.outbound.send_text(ticket, contact, notice).await {
                        tracing::warn!(ticket_id = ticket.id, error = %e, "hand-off notice send failed");
                    }
                }
            }
        }
    }

    async fn send_agent_introduction(
        &self,
        tenant: &Tenant,
        settings: &crate::db::Settings,
        ticket: &Ticket,
        contact: &Contact,
        user_id: Option<i64>,
    ) {
        if !settings.msg_auto {
            return;
        }

        let agent = self.agent_name(user_id);
        let intro = format!("*Automated message:*\n{agent} has started attending you.");
        if let Err(e) = self.outbound.send_text(ticket, contact, &intro).await {
            tracing::warn!(ticket_id = ticket.id, error = %e, "agent introduction send failed");
        }

        if let Some(greeting) = non_empty(tenant.greeting_message.as_deref()) {
            if let Err(e) = self.outbound.send_text(ticket, contact, greeting).await {
                tracing::warn!(ticket_id = ticket.id, error = %e, "greeting send failed");
            }
        }
    }

    fn agent_name(&self, user_id: Option<i64>) -> String {
        UserRepo::new(self.db.clone())
            .display_name(user_id)
            .unwrap_or_else(|_| "-".to_string())
    }
}

fn parse_rating(body: &str) -> Option<i64> {
    body.trim().parse().ok()
}

fn rating_prompt(template: Option<&str>) -> String {
    match non_empty(template) {
        Some(text) => format!("{text}\n\n{RATING_SCALE}"),
        None => RATING_SCALE.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}
