//! Payment services
//!
//! Incoming payments (receiving side), outgoing payments (sending side,
//! quote-funded), grant accounting, and the lifecycle runner that drives
//! funded payments to completion.

mod grant;
mod incoming;
mod lifecycle;
mod outgoing;

pub use grant::{GrantLimits, GrantValidation, IsoPeriod, PaymentGrant, RepeatingInterval};
pub use incoming::{
    ConnectionInfo, CreateIncomingPaymentArgs, IncomingPaymentError, IncomingPaymentService,
};
pub use lifecycle::{
    PayError, PayOutcome, PayPlan, PaySender, PaymentLifecycle, StreamPaySender,
};
pub use outgoing::{
    CreateOutgoingPaymentArgs, FundArgs, OutgoingPaymentError, OutgoingPaymentService,
};
