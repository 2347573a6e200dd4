//! Last-known state for one gateway: the channel-information cache plus a
//! converted snapshot per (channel, device). Owned by whichever session
//! manager holds the active connection; read freely by collaborators.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::convert;
use crate::types::{ChannelInfo, ChannelInformation, RawState, StateSnapshot};

/// Sentinel written over a cached zero flow rate when a powered-on unit's
/// read fails to decode; some units report zero flow in exactly that case.
const FLOW_RATE_SENTINEL: f64 = 0.1;

type StateCallback = Box<dyn Fn(u8, u8, &StateSnapshot) + Send + Sync>;

#[derive(Default)]
struct Tree {
    channel_info: Option<ChannelInformation>,
    units: HashMap<(u8, u8), StateSnapshot>,
}

/// Shared state tree. Subscribers registered here are invoked after every
/// stored update, with the (channel, device) key and the new snapshot.
#[derive(Default)]
pub struct StateModel {
    tree: Mutex<Tree>,
    subscribers: Mutex<Vec<StateCallback>>,
}

impl StateModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, f: impl Fn(u8, u8, &StateSnapshot) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(f));
    }

    pub fn set_channel_info(&self, info: ChannelInformation) {
        self.tree.lock().unwrap().channel_info = Some(info);
    }

    pub fn channel_info(&self) -> Option<ChannelInformation> {
        self.tree.lock().unwrap().channel_info.clone()
    }

    pub fn channel(&self, number: u8) -> Option<ChannelInfo> {
        self.tree
            .lock()
            .unwrap()
            .channel_info
            .as_ref()
            .and_then(|info| info.channel(number))
            .cloned()
    }

    pub fn snapshot(&self, channel: u8, device_number: u8) -> Option<StateSnapshot> {
        self.tree
            .lock()
            .unwrap()
            .units
            .get(&(channel, device_number))
            .cloned()
    }

    /// Convert and store one successful state reading, then notify
    /// subscribers. Returns the stored snapshot. Conversion runs exactly
    /// once, here; a channel we have no information for yet is skipped.
    pub fn apply_state(
        &self,
        channel: u8,
        device_number: u8,
        raw: &RawState,
    ) -> Option<StateSnapshot> {
        let info = match self.channel(channel) {
            Some(info) => info,
            None => {
                warn!(channel, "state reading for unknown channel dropped");
                return None;
            }
        };
        let snapshot = convert::convert_state(raw, &info);
        self.tree
            .lock()
            .unwrap()
            .units
            .insert((channel, device_number), snapshot.clone());
        self.notify(channel, device_number, &snapshot);
        Some(snapshot)
    }

    /// A read failed to decode. The prior snapshot is preserved, with one
    /// documented exception: a powered-on unit cached at zero flow gets the
    /// small nonzero sentinel, because that zero is a known artifact of the
    /// failed read, not a measurement.
    pub fn apply_decode_failure(&self, channel: u8, device_number: u8) {
        let corrected = {
            let mut tree = self.tree.lock().unwrap();
            match tree.units.get_mut(&(channel, device_number)) {
                Some(snapshot) if snapshot.power && snapshot.hot_water_flow_rate == 0.0 => {
                    snapshot.hot_water_flow_rate = FLOW_RATE_SENTINEL;
                    Some(snapshot.clone())
                }
                _ => None,
            }
        };
        if let Some(snapshot) = corrected {
            debug!(channel, device_number, "zero flow rate corrected to sentinel");
            self.notify(channel, device_number, &snapshot);
        }
    }

    fn notify(&self, channel: u8, device_number: u8, snapshot: &StateSnapshot) {
        for cb in self.subscribers.lock().unwrap().iter() {
            cb(channel, device_number, snapshot);
        }
    }
}
