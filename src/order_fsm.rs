//! Guarded order status transitions.
//!
//! ```text
//!   New ──► PartiallyFilled ──► Filled
//!    │            │
//!    ├──► Filled  ├──► Canceled
//!    ├──► Canceled└──► Expired
//!    ├──► Expired
//!    └──► Rejected
//! ```
//!
//! Terminal states (Filled, Canceled, Expired, Rejected) have no exits.
use crate::model::OrderStatus;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition from {0} to {1}")]
    InvalidTransition(OrderStatus, OrderStatus),
}

pub struct OrderStateMachine;

impl OrderStateMachine {
    pub fn transition(current: OrderStatus, next: OrderStatus) -> Result<OrderStatus, StateError> {
        match (current, next) {
            (OrderStatus::New, OrderStatus::PartiallyFilled) => Ok(next),
            (OrderStatus::New, OrderStatus::Filled) => Ok(next),
            (OrderStatus::New, OrderStatus::Canceled) => Ok(next),
            (OrderStatus::New, OrderStatus::Expired) => Ok(next),
            (OrderStatus::New, OrderStatus::Rejected) => Ok(next),

            (OrderStatus::PartiallyFilled, OrderStatus::PartiallyFilled) => Ok(next),
            (OrderStatus::PartiallyFilled, OrderStatus::Filled) => Ok(next),
            (OrderStatus::PartiallyFilled, OrderStatus::Canceled) => Ok(next),
            (OrderStatus::PartiallyFilled, OrderStatus::Expired) => Ok(next),

            _ => Err(StateError::InvalidTransition(current, next)),
        }
    }
}
