use serde::Serialize;
use uuid::Uuid;

/// Protocol transitions pushed to `/ws` subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DispatchEvent {
    Offered {
        ride_id: Uuid,
        driver_id: Uuid,
        queue_position: usize,
        total_drivers: usize,
    },
    Accepted {
        ride_id: Uuid,
        driver_id: Uuid,
    },
    Exhausted {
        ride_id: Uuid,
    },
    Cancelled {
        ride_id: Uuid,
    },
}

impl DispatchEvent {
    pub fn ride_id(&self) -> Uuid {
        match self {
            DispatchEvent::Offered { ride_id, .. }
            | DispatchEvent::Accepted { ride_id, .. }
            | DispatchEvent::Exhausted { ride_id }
            | DispatchEvent::Cancelled { ride_id } => *ride_id,
        }
    }
}
