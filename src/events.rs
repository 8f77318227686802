use std::fmt;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    EntityLoaded { id: Uuid, caption: String },
    EntityUnloaded { id: Uuid },
    /// An entity changed the scene's drawing options while loading.
    DrawingOptionUpdated,
    PoiUpdated([String; 3]),
    Initialized,
    Progress { current: u64, total: u64, label: String, id: Uuid, source: String, done: bool },
}

impl SceneEvent {
    pub fn poi_updated(poi: glam::Vec3) -> Self {
        SceneEvent::PoiUpdated([format!("{:.3}", poi.x), format!("{:.3}", poi.y), format!("{:.3}", poi.z)])
    }
}

impl fmt::Display for SceneEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneEvent::EntityLoaded { id, caption } => write!(f, "EntityLoaded id={id} caption={caption}"),
            SceneEvent::EntityUnloaded { id } => write!(f, "EntityUnloaded id={id}"),
            SceneEvent::DrawingOptionUpdated => write!(f, "DrawingOptionUpdated"),
            SceneEvent::PoiUpdated([x, y, z]) => write!(f, "PoiUpdated ({x}, {y}, {z})"),
            SceneEvent::Initialized => write!(f, "Initialized"),
            SceneEvent::Progress { current, total, label, source, done, .. } => {
                write!(f, "Progress {source} {label} {current}/{total}")?;
                if *done {
                    write!(f, " done")?;
                }
                Ok(())
            }
        }
    }
}

/// Scene-wide event queue. Entities push while the GPU thread prepares them; the host drains
/// once per frame.
#[derive(Debug, Default)]
pub struct EventBus {
    events: Mutex<Vec<SceneEvent>>,
}

impl EventBus {
    pub fn push(&self, event: SceneEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn drain(&self) -> Vec<SceneEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }
}
