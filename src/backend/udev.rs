//! Connector hotplug notifications through `udev`
//!
//! The kernel announces connector changes of a drm device as `change` uevents carrying
//! `HOTPLUG=1`. [`HotplugMonitor`] filters them for one device and yields a
//! [`HotplugEvent`], upon which the compositor should call
//! [`KmsBackend::rescan_connectors`](crate::backend::drm::KmsBackend::rescan_connectors).

use std::{ffi::OsStr, io, path::Path};

use calloop::{
    generic::Generic, EventSource, Interest, Mode as TriggerMode, Poll, PostAction, Readiness, Token,
    TokenFactory,
};
use drm::control::connector;
use libc::dev_t;
use tracing::{debug, info_span, trace};
use udev::{EventType, MonitorBuilder, MonitorSocket};

/// A connector of the monitored device changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugEvent {
    /// The connector, if the kernel named it
    pub connector: Option<connector::Handle>,
}

/// Event source watching the `drm` subsystem for hotplug events of one device
pub struct HotplugMonitor {
    devnum: dev_t,
    monitor: MonitorSocket,
    source: Generic<MonitorSocket>,
    span: tracing::Span,
}

impl std::fmt::Debug for HotplugMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotplugMonitor").field("devnum", &self.devnum).finish_non_exhaustive()
    }
}

impl HotplugMonitor {
    /// Watch the device with the given device number
    pub fn new(devnum: dev_t) -> io::Result<HotplugMonitor> {
        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
        Ok(HotplugMonitor {
            devnum,
            source: Generic::new(monitor.clone(), Interest::READ, TriggerMode::Level),
            monitor,
            span: info_span!("backend_udev", devnum),
        })
    }

    /// Watch the device node at `path`
    pub fn for_device(path: impl AsRef<Path>) -> io::Result<HotplugMonitor> {
        let stat = rustix::fs::stat(path.as_ref())?;
        HotplugMonitor::new(stat.st_rdev as dev_t)
    }

    /// Device number of the watched device
    pub fn devnum(&self) -> dev_t {
        self.devnum
    }
}

fn connector_from(value: Option<&OsStr>) -> Option<connector::Handle> {
    value
        .and_then(OsStr::to_str)
        .and_then(|id| id.trim().parse::<u32>().ok())
        .and_then(drm::control::from_u32)
}

impl EventSource for HotplugMonitor {
    type Event = HotplugEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, readiness: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let _guard = self.span.enter();
        let monitor = self.monitor.clone();
        let devnum = self.devnum;
        self.source.process_events(readiness, token, |_, _| {
            for event in monitor.clone() {
                if event.event_type() != EventType::Change || event.devnum() != Some(devnum) {
                    continue;
                }
                if event.property_value("HOTPLUG").and_then(OsStr::to_str) != Some("1") {
                    trace!("ignoring change event without HOTPLUG");
                    continue;
                }

                let connector = connector_from(event.property_value("CONNECTOR"));
                debug!(?connector, "connector hotplug");
                callback(HotplugEvent { connector }, &mut ());
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, factory)
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}
