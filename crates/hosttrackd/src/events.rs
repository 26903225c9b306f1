//! Device update events and listener fan-out.

use crate::device::Device;
use crate::entity::FieldSet;
use hosttrack_types::SwitchPort;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// A committed change to the device model.
#[derive(Clone)]
pub enum DeviceEvent {
    /// A device was learned for the first time.
    Added(Arc<Device>),
    /// An existing device gained new information; the set names the fields
    /// that changed.
    Changed(Arc<Device>, FieldSet),
    /// A device was removed.
    Deleted(Arc<Device>),
    /// The authoritative attachment point changed.
    Moved {
        device: Arc<Device>,
        /// The device as it was before the move, when known.
        previous: Option<Arc<Device>>,
    },
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::Added(d) => write!(f, "Added({})", d),
            DeviceEvent::Changed(d, fields) => write!(f, "Changed({}, {})", d, fields),
            DeviceEvent::Deleted(d) => write!(f, "Deleted({})", d),
            DeviceEvent::Moved { device, .. } => write!(f, "Moved({})", device),
        }
    }
}

/// Callbacks delivered, in registration order, for every committed change.
pub trait DeviceListener: Send + Sync {
    fn device_added(&self, device: &Device);
    fn device_changed(&self, device: &Device, fields: FieldSet);
    fn device_removed(&self, device: &Device);
    fn device_moved(&self, device: &Device);
}

/// Direction of a host-link edge update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLinkChange {
    Added,
    Removed,
}

/// External topology bookkeeping for host-to-port edges. Notified with the
/// resolved attachment port on ADD and DELETE, and with both edges on a
/// move.
pub trait HostLinkSink: Send + Sync {
    fn host_link_updated(&self, device: &Device, port: SwitchPort, change: HostLinkChange);
}

/// Synchronous, ordered event fan-out.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn DeviceListener>>>,
    host_link_sink: RwLock<Option<Arc<dyn HostLinkSink>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Listeners are invoked in registration order.
    pub fn add_listener(&self, listener: Arc<dyn DeviceListener>) {
        self.listeners.write().push(listener);
    }

    /// Installs the host-link sink.
    pub fn set_host_link_sink(&self, sink: Arc<dyn HostLinkSink>) {
        *self.host_link_sink.write() = Some(sink);
    }

    /// Delivers `events` in order: host-link bookkeeping first, then every
    /// listener in registration order.
    pub fn dispatch(&self, events: Vec<DeviceEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        let sink = self.host_link_sink.read().clone();
        for event in events {
            trace!(?event, "dispatching device update");
            if let Some(sink) = &sink {
                self.update_host_link(sink.as_ref(), &event);
            }
            for listener in &listeners {
                match &event {
                    DeviceEvent::Added(d) => listener.device_added(d),
                    DeviceEvent::Changed(d, fields) => listener.device_changed(d, *fields),
                    DeviceEvent::Deleted(d) => listener.device_removed(d),
                    DeviceEvent::Moved { device, .. } => listener.device_moved(device),
                }
            }
        }
    }

    fn update_host_link(&self, sink: &dyn HostLinkSink, event: &DeviceEvent) {
        match event {
            DeviceEvent::Added(d) => {
                if let Some(ap) = d.primary_attachment_point() {
                    sink.host_link_updated(d, ap.port(), HostLinkChange::Added);
                }
            }
            DeviceEvent::Deleted(d) => {
                if let Some(ap) = d.primary_attachment_point() {
                    sink.host_link_updated(d, ap.port(), HostLinkChange::Removed);
                }
            }
            DeviceEvent::Moved { device, previous } => {
                let old_port = previous
                    .as_ref()
                    .and_then(|p| p.primary_attachment_point())
                    .map(|ap| ap.port());
                let new_port = device.primary_attachment_point().map(|ap| ap.port());
                if let Some(old) = old_port {
                    if old_port != new_port {
                        sink.host_link_updated(device, old, HostLinkChange::Removed);
                    }
                }
                if let Some(new) = new_port {
                    sink.host_link_updated(device, new, HostLinkChange::Added);
                }
            }
            DeviceEvent::Changed(..) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::DefaultEntityClass;
    use crate::entity::{DeviceField, Entity};
    use hosttrack_types::{MacAddress, NodeId};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl DeviceListener for Recorder {
        fn device_added(&self, device: &Device) {
            self.calls.lock().push(format!("added:{}", device.mac()));
        }

        fn device_changed(&self, device: &Device, fields: FieldSet) {
            self.calls
                .lock()
                .push(format!("changed:{}:{}", device.mac(), fields));
        }

        fn device_removed(&self, device: &Device) {
            self.calls.lock().push(format!("removed:{}", device.mac()));
        }

        fn device_moved(&self, device: &Device) {
            self.calls.lock().push(format!("moved:{}", device.mac()));
        }
    }

    fn device(mac: u64) -> Arc<Device> {
        let port = SwitchPort::new(NodeId::new(1), 1);
        Arc::new(Device::new(
            1,
            Entity::new(MacAddress::from_u64(mac), None, None, Some(port), Some(0)),
            Arc::new(DefaultEntityClass),
        ))
    }

    #[test]
    fn test_events_delivered_in_order() {
        let dispatcher = EventDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_listener(recorder.clone());

        let d = device(0xa);
        dispatcher.dispatch(vec![
            DeviceEvent::Added(d.clone()),
            DeviceEvent::Changed(d.clone(), FieldSet::of(&[DeviceField::Ipv4])),
            DeviceEvent::Deleted(d),
        ]);

        let calls = recorder.calls.lock();
        assert_eq!(
            *calls,
            vec![
                "added:00:00:00:00:00:0a".to_string(),
                "changed:00:00:00:00:00:0a:{IPV4}".to_string(),
                "removed:00:00:00:00:00:0a".to_string(),
            ]
        );
    }

    #[derive(Default)]
    struct EdgeRecorder {
        edges: Mutex<Vec<(SwitchPort, HostLinkChange)>>,
    }

    impl HostLinkSink for EdgeRecorder {
        fn host_link_updated(&self, _device: &Device, port: SwitchPort, change: HostLinkChange) {
            self.edges.lock().push((port, change));
        }
    }

    #[test]
    fn test_host_link_bookkeeping() {
        let dispatcher = EventDispatcher::new();
        let sink = Arc::new(EdgeRecorder::default());
        dispatcher.set_host_link_sink(sink.clone());

        let d = device(0xa);
        dispatcher.dispatch(vec![DeviceEvent::Added(d.clone())]);
        dispatcher.dispatch(vec![DeviceEvent::Deleted(d)]);

        let port = SwitchPort::new(NodeId::new(1), 1);
        let edges = sink.edges.lock();
        assert_eq!(
            *edges,
            vec![(port, HostLinkChange::Added), (port, HostLinkChange::Removed)]
        );
    }
}
