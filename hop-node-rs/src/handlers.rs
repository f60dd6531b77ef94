//! Built-in handlers and relay filters for the node binary

use chrono::Utc;
use hop_core::ocpp::{
    BootNotification, BootNotificationResponse, DataTransfer, DataTransferResponse,
    DataTransferStatus, Heartbeat, HeartbeatResponse, RegistrationStatus, Reset, ResetResponse,
    ResetStatus, ResetType, StatusNotification, StatusNotificationResponse,
};
use hop_core::{ForwardingDecision, Node, Outcome};
use tracing::info;

/// Vendor id answered by the DataTransfer echo handler
pub const ECHO_VENDOR_ID: &str = "hop";

/// Heartbeat interval handed out on boot, in seconds
const BOOT_INTERVAL_SECS: i32 = 300;

/// Answer every operation of the standard catalog addressed to this node
pub fn register_defaults(node: &Node) {
    node.register_operation::<BootNotification, _, _>(|req, envelope| async move {
        info!(
            "BootNotification from {:?}: {} {} ({:?})",
            envelope.origin(),
            req.charging_station.vendor_name,
            req.charging_station.model,
            req.reason
        );
        Ok(Some(BootNotificationResponse {
            current_time: Utc::now(),
            interval: BOOT_INTERVAL_SECS,
            status: RegistrationStatus::Accepted,
            status_info: None,
        }))
    });

    node.register_operation::<Heartbeat, _, _>(|_, _| async {
        Ok(Some(HeartbeatResponse {
            current_time: Utc::now(),
        }))
    });

    node.register_operation::<StatusNotification, _, _>(|req, envelope| async move {
        info!(
            "EVSE {} connector {} of {:?} is {:?}",
            req.evse_id,
            req.connector_id,
            envelope.origin(),
            req.connector_status
        );
        Ok(Some(StatusNotificationResponse {}))
    });

    node.register_operation::<Reset, _, _>(|req, envelope| async move {
        info!("Reset {:?} requested by {:?}", req.reset_type, envelope.origin());
        let status = match req.reset_type {
            ResetType::Immediate => ResetStatus::Accepted,
            ResetType::OnIdle => ResetStatus::Scheduled,
        };
        Ok(Some(ResetResponse {
            status,
            status_info: None,
        }))
    });

    // Echo for our own vendor id; other vendors are left to other handlers
    node.register_operation::<DataTransfer, _, _>(|req, _| async move {
        if req.vendor_id != ECHO_VENDOR_ID {
            return Ok(None);
        }
        Ok(Some(DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: req.data,
            status_info: None,
        }))
    });

    // Fallback after the echo handler
    node.register_operation::<DataTransfer, _, _>(|_, _| async {
        Ok(Some(DataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: None,
            status_info: None,
        }))
    });
}

/// Reject relayed requests for `action` at this node
pub fn block_action(node: &Node, action: &str) {
    let relay = node.id().clone();
    let blocked = action.to_string();
    node.register_filter(action, move |_| {
        let outcome = Outcome::filtered(format!("{} blocked at {}", blocked, relay));
        async move { Ok(Some(ForwardingDecision::reject_with(outcome))) }
    });
    info!("Blocking relayed {} requests", action);
}
