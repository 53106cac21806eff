//! Ticket routing: resolution, lifecycle transitions, chatbot menus,
//! dispatch debouncing, and working-hours checks

pub mod chatbot;
pub mod debounce;
pub mod resolver;
pub mod schedule;
pub mod transition;

pub use chatbot::ChatbotRouter;
pub use debounce::DispatchDebouncer;
pub use resolver::TicketResolver;
pub use transition::{TicketTransitions, TicketUpdate, TransitionOutcome};
