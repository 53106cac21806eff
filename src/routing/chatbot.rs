//! Chatbot routing
//!
//! Runs while a ticket has no agent: presents the queue menu, interprets
//! 1-based replies, assigns the chosen queue, and walks its sub-options.
//! Unresolved replies re-present the menu through the dispatch debouncer so
//! multi-part inbound bursts produce a single prompt.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RoutingConfig;
use crate::db::{
    ChatbotMode, Contact, DbPool, Queue, QueueOption, QueueRepo, Settings, Tenant, Ticket,
    TicketStatus,
};
use crate::pipeline::normalizer;
use crate::pipeline::outbound::OutboundDispatcher;
use crate::protocol::{MenuEntry, RawContent, RawMessage};
use crate::routing::debounce::DispatchDebouncer;
use crate::routing::transition::{TicketTransitions, TicketUpdate};
use crate::Result;

/// Text-mode footer of the sub-option menu
const BACK_OPTION: &str = "*#* - Back to the main menu";

/// Queue and sub-option menu router
pub struct ChatbotRouter {
    db: DbPool,
    outbound: OutboundDispatcher,
    debouncer: Arc<DispatchDebouncer>,
    transitions: Arc<TicketTransitions>,
    config: RoutingConfig,
}

impl ChatbotRouter {
    /// Create a router
    #[must_use]
    pub const fn new(
        db: DbPool,
        outbound: OutboundDispatcher,
        debouncer: Arc<DispatchDebouncer>,
        transitions: Arc<TicketTransitions>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            db,
            outbound,
            debouncer,
            transitions,
            config,
        }
    }

    /// Route a message on a ticket that has neither queue nor agent
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails; menu-send failures are logged
    pub async fn route(
        &self,
        tenant: &Tenant,
        settings: &Settings,
        ticket: &Ticket,
        contact: &Contact,
        msg: &RawMessage,
    ) -> Result<()> {
        let queues = QueueRepo::new(self.db.clone()).list_for_tenant(tenant.id)?;
        if queues.is_empty() {
            return Ok(());
        }

        // A single configured queue is assigned silently
        if let [only] = queues.as_slice() {
            self.transitions
                .update(ticket.id, TicketUpdate::default().queue(Some(only.id)))
                .await?;
            return Ok(());
        }

        let chosen = selected_index(msg).and_then(|i| queues.get(i - 1));

        match chosen {
            Some(queue) => self.assign_queue(settings, ticket, contact, queue).await,
            None => {
                self.schedule_queue_menu(settings, tenant, ticket, contact, queues);
                Ok(())
            }
        }
    }

    /// Route a message on a ticket with a queue but no agent: sub-option
    /// selection, or `#` to return to the main menu
    ///
    /// # Errors
    ///
    /// Returns error if persistence fails
    pub async fn route_options(
        &self,
        tenant: &Tenant,
        settings: &Settings,
        ticket: &Ticket,
        contact: &Contact,
        msg: &RawMessage,
    ) -> Result<()> {
        let Some(queue_id) = ticket.queue_id else {
            return Ok(());
        };
        let repo = QueueRepo::new(self.db.clone());
        let options = repo.options_for_queue(queue_id)?;
        if options.is_empty() {
            return Ok(());
        }

        if normalizer::body_of(msg).trim() == "#" {
            let outcome = self
                .transitions
                .update(
                    ticket.id,
                    TicketUpdate::default().queue(None).option(None).bot(false),
                )
                .await?;
            let queues = repo.list_for_tenant(tenant.id)?;
            self.schedule_queue_menu(settings, tenant, outcome.ticket(), contact, queues);
            return Ok(());
        }

        let chosen = selected_index(msg).and_then(|i| options.get(i - 1));

        match chosen {
            Some(option) => {
                self.transitions
                    .update(ticket.id, TicketUpdate::default().option(Some(option.id)))
                    .await?;
                if !option.message.trim().is_empty() {
                    if let Err(e) = self.outbound.send_text(ticket, contact, &option.message).await {
                        tracing::warn!(ticket_id = ticket.id, error = %e, "option message send failed");
                    }
                }
                Ok(())
            }
            None => {
                let Some(queue) = repo.get(queue_id)? else {
                    return Ok(());
                };
                self.schedule_option_menu(settings, ticket, contact, &queue, options);
                Ok(())
            }
        }
    }

    /// Assign the chosen queue, then greet or present its sub-options
    async fn assign_queue(
        &self,
        settings: &Settings,
        ticket: &Ticket,
        contact: &Contact,
        queue: &Queue,
    ) -> Result<()> {
        let options = QueueRepo::new(self.db.clone()).options_for_queue(queue.id)?;

        let outcome = self
            .transitions
            .update(
                ticket.id,
                TicketUpdate::default()
                    .queue(Some(queue.id))
                    .bot(!options.is_empty()),
            )
            .await?;
        let ticket = outcome.ticket();

        if options.is_empty() {
            if !queue.greeting_message.trim().is_empty() {
                if let Err(e) = self
                    .outbound
                    .send_text(ticket, contact, &queue.greeting_message)
                    .await
                {
                    tracing::warn!(ticket_id = ticket.id, error = %e, "queue greeting send failed");
                }
            }
            return Ok(());
        }

        let entries = option_entries(&options);
        let menu = Menu {
            mode: settings.chatbot_mode,
            ceiling: self.config.button_menu_ceiling,
            greeting: queue.greeting_message.clone(),
            entries,
            text_footer: Some(BACK_OPTION.to_string()),
        };
        present_menu(&self.outbound, ticket.clone(), contact.clone(), menu).await;
        Ok(())
    }

    /// Debounced re-presentation of the top-level queue menu
    fn schedule_queue_menu(
        &self,
        settings: &Settings,
        tenant: &Tenant,
        ticket: &Ticket,
        contact: &Contact,
        queues: Vec<Queue>,
    ) {
        let menu = Menu {
            mode: settings.chatbot_mode,
            ceiling: self.config.button_menu_ceiling,
            greeting: tenant.greeting_message.clone().unwrap_or_default(),
            entries: queue_entries(&queues),
            text_footer: None,
        };
        self.schedule_menu(ticket, contact, menu);
    }

    /// Debounced re-presentation of a queue's sub-option menu
    fn schedule_option_menu(
        &self,
        settings: &Settings,
        ticket: &Ticket,
        contact: &Contact,
        queue: &Queue,
        options: Vec<QueueOption>,
    ) {
        let menu = Menu {
            mode: settings.chatbot_mode,
            ceiling: self.config.button_menu_ceiling,
            greeting: queue.greeting_message.clone(),
            entries: option_entries(&options),
            text_footer: Some(BACK_OPTION.to_string()),
        };
        self.schedule_menu(ticket, contact, menu);
    }

    fn schedule_menu(&self, ticket: &Ticket, contact: &Contact, menu: Menu) {
        let outbound = self.outbound.clone();
        let ticket = ticket.clone();
        let contact = contact.clone();
        self.debouncer.schedule(
            ticket.tenant_id,
            ticket.id,
            Duration::from_millis(self.config.debounce_ms),
            async move {
                present_menu(&outbound, ticket, contact, menu).await;
            },
        );
    }
}

/// A menu ready to render in any presentation mode
struct Menu {
    mode: ChatbotMode,
    ceiling: usize,
    greeting: String,
    entries: Vec<MenuEntry>,
    text_footer: Option<String>,
}

/// Render and send a menu; failures are logged, never propagated (the
/// contact can always try again)
async fn present_menu(outbound: &OutboundDispatcher, ticket: Ticket, contact: Contact, menu: Menu) {
    // Never prompt a conversation that left the bot stage while the
    // debounce window was pending
    if ticket.status == TicketStatus::Closed {
        return;
    }

    let result = match effective_mode(menu.mode, menu.entries.len(), menu.ceiling) {
        ChatbotMode::Text => {
            let body = render_text_menu(&menu.greeting, &menu.entries, menu.text_footer.as_deref());
            outbound.send_text(&ticket, &contact, &body).await
        }
        ChatbotMode::Button => {
            outbound
                .send_buttons(&ticket, &contact, &menu.greeting, &menu.entries)
                .await
        }
        ChatbotMode::List => {
            outbound
                .send_list(&ticket, &contact, &menu.greeting, &menu.entries)
                .await
        }
    };

    if let Err(e) = result {
        tracing::warn!(ticket_id = ticket.id, error = %e, "menu send failed");
    }
}

/// Button mode falls back to text above the option ceiling; list mode never
/// does
fn effective_mode(mode: ChatbotMode, entry_count: usize, ceiling: usize) -> ChatbotMode {
    match mode {
        ChatbotMode::Button if entry_count > ceiling => ChatbotMode::Text,
        other => other,
    }
}

fn render_text_menu(greeting: &str, entries: &[MenuEntry], footer: Option<&str>) -> String {
    let mut body = String::new();
    if !greeting.trim().is_empty() {
        body.push_str(greeting);
        body.push_str("\n\n");
    }
    for (index, entry) in entries.iter().enumerate() {
        body.push_str(&format!("*{}* - {}\n", index + 1, entry.title));
    }
    if let Some(footer) = footer {
        body.push('\n');
        body.push_str(footer);
    }
    body
}

fn queue_entries(queues: &[Queue]) -> Vec<MenuEntry> {
    queues
        .iter()
        .enumerate()
        .map(|(index, queue)| MenuEntry {
            id: (index + 1).to_string(),
            title: queue.name.clone(),
        })
        .collect()
}

fn option_entries(options: &[QueueOption]) -> Vec<MenuEntry> {
    options
        .iter()
        .enumerate()
        .map(|(index, option)| MenuEntry {
            id: (index + 1).to_string(),
            title: option.name.clone(),
        })
        .collect()
}

/// Interpret a reply as a 1-based menu index: native button/list reply ids
/// take precedence over the text body
fn selected_index(msg: &RawMessage) -> Option<usize> {
    let raw = match &msg.content {
        RawContent::ButtonReply { selected_id, .. } => selected_id.clone(),
        RawContent::ListReply { row_id, .. } => row_id.clone(),
        _ => normalizer::body_of(msg),
    };
    match raw.trim().parse::<usize>() {
        Ok(index) if index >= 1 => Some(index),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatAddress;

    fn text_msg(body: &str) -> RawMessage {
        RawMessage::text("id", ChatAddress::from_jid("j@s.whatsapp.net"), false, body)
    }

    #[test]
    fn selected_index_parses_body_and_native_replies() {
        assert_eq!(selected_index(&text_msg("2")), Some(2));
        assert_eq!(selected_index(&text_msg(" 1 ")), Some(1));
        assert_eq!(selected_index(&text_msg("9")), Some(9));
        assert_eq!(selected_index(&text_msg("hello")), None);
        assert_eq!(selected_index(&text_msg("0")), None);

        let mut msg = text_msg("");
        msg.content = RawContent::ButtonReply {
            selected_id: "3".to_string(),
            display_text: "Sales".to_string(),
        };
        assert_eq!(selected_index(&msg), Some(3));

        msg.content = RawContent::ListReply {
            row_id: "1".to_string(),
            title: "Support".to_string(),
        };
        assert_eq!(selected_index(&msg), Some(1));
    }

    #[test]
    fn button_mode_falls_back_to_text_above_ceiling() {
        assert_eq!(effective_mode(ChatbotMode::Button, 4, 4), ChatbotMode::Button);
        assert_eq!(effective_mode(ChatbotMode::Button, 5, 4), ChatbotMode::Text);
        assert_eq!(effective_mode(ChatbotMode::List, 12, 4), ChatbotMode::List);
        assert_eq!(effective_mode(ChatbotMode::Text, 2, 4), ChatbotMode::Text);
    }

    #[test]
    fn text_menu_numbers_entries() {
        let entries = vec![
            MenuEntry {
                id: "1".to_string(),
                title: "Support".to_string(),
            },
            MenuEntry {
                id: "2".to_string(),
                title: "Sales".to_string(),
            },
        ];
        let body = render_text_menu("Welcome!", &entries, Some(BACK_OPTION));
        assert!(body.starts_with("Welcome!\n\n"));
        assert!(body.contains("*1* - Support"));
        assert!(body.contains("*2* - Sales"));
        assert!(body.ends_with(BACK_OPTION));
    }
}
