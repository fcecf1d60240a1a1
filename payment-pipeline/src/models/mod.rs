pub mod expense;
pub mod payment;

pub use expense::{Expense, ExpenseStatus};
pub use payment::{
    generate_external_id, map_external_status, Payment, PaymentStatus, StatusUpdate, MAX_RETRIES,
};
