pub mod bus;
pub mod event;

pub use bus::{handler_fn, EventBus, EventHandler, FnHandler, HandlerError};
pub use event::{
    Event, EventPayload, EventType, ExpenseApproved, PaymentCompleted, PaymentFailed,
};
