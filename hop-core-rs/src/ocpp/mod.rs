//! OCPP 2.0.1 operation catalog
//!
//! - `types`: request and response records
//! - operation markers binding each record pair to its action tag

pub mod types;

pub use types::*;

use crate::operation::{Catalog, Operation};

/// CS -> CSMS registration
pub struct BootNotification;

impl Operation for BootNotification {
    type Request = BootNotificationRequest;
    type Response = BootNotificationResponse;
    const ACTION: &'static str = "BootNotification";
}

/// CS -> CSMS keepalive
pub struct Heartbeat;

impl Operation for Heartbeat {
    type Request = HeartbeatRequest;
    type Response = HeartbeatResponse;
    const ACTION: &'static str = "Heartbeat";
}

/// CS -> CSMS connector status
pub struct StatusNotification;

impl Operation for StatusNotification {
    type Request = StatusNotificationRequest;
    type Response = StatusNotificationResponse;
    const ACTION: &'static str = "StatusNotification";
}

/// CSMS -> CS reset
pub struct Reset;

impl Operation for Reset {
    type Request = ResetRequest;
    type Response = ResetResponse;
    const ACTION: &'static str = "Reset";
}

/// Vendor specific exchange, either direction
pub struct DataTransfer;

impl Operation for DataTransfer {
    type Request = DataTransferRequest;
    type Response = DataTransferResponse;
    const ACTION: &'static str = "DataTransfer";
}

/// Catalog with every operation defined here
pub fn standard_catalog() -> Catalog {
    let catalog = Catalog::new();
    catalog.register::<BootNotification>();
    catalog.register::<Heartbeat>();
    catalog.register::<StatusNotification>();
    catalog.register::<Reset>();
    catalog.register::<DataTransfer>();
    catalog
}
