//! Ephemeral presence: who is looking at what.
//!
//! Tracks the local client's cursor, selection, tool and viewport, plus one
//! [`PresenceData`] record per remote client. Remote records expire when a
//! client stops sending updates without a clean leave, so memory stays
//! bounded.
//!
//! ```text
//! local pointer move
//!       │
//!       ▼
//! PresenceTracker::update_local_presence()  ── returns PresencePatch
//!       │
//!       ▼
//! SyncProtocol::update_presence()           ── throttled PRESENCE frame
//!       │                                        (WebSocket)
//!       ▼
//! remote PresenceTracker::update_remote_presence()
//!       │
//!       ▼
//! active_cursors() / active_selections()    ── rendering collaborators
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::clock::TimeSource;
use crate::config::PresenceConfig;
use crate::events::{EventBus, Subscription};
use crate::operation::NodeId;
use crate::timer::ScheduledTask;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Visible region of the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub center: Point,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            center: Point::ZERO,
            zoom: 1.0,
        }
    }
}

/// RGB color for a collaborator's cursor and selection outline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl CursorColor {
    /// A stable, vivid color derived from a UUID.
    ///
    /// Hue comes from the UUID bits; saturation and lightness are fixed so
    /// every cursor stays readable on a light canvas.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// `#rrggbb` form used on the wire.
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Full presence record for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceData {
    pub client_id: String,
    pub user_name: String,
    pub color: String,
    pub cursor: Option<Point>,
    /// Selected node ids, in the order the user selected them.
    pub selection: Vec<NodeId>,
    pub tool: Option<String>,
    pub viewport: Option<Viewport>,
    /// Wall-clock ms of the last update received.
    pub last_seen: u64,
    pub active: bool,
}

impl PresenceData {
    pub fn new(
        client_id: impl Into<String>,
        user_name: impl Into<String>,
        color: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_name: user_name.into(),
            color: color.into(),
            cursor: None,
            selection: Vec::new(),
            tool: None,
            viewport: None,
            last_seen: now_ms,
            active: true,
        }
    }

    /// Replace every field the patch provides.
    pub fn apply(&mut self, patch: &PresencePatch) {
        if let Some(name) = &patch.user_name {
            self.user_name = name.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        if let Some(cursor) = patch.cursor {
            self.cursor = cursor;
        }
        if let Some(selection) = &patch.selection {
            self.selection = selection.clone();
        }
        if let Some(tool) = &patch.tool {
            self.tool = Some(tool.clone());
        }
        if let Some(viewport) = patch.viewport {
            self.viewport = Some(viewport);
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
    }

    pub fn is_expired(&self, now_ms: u64, expiration_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > expiration_ms
    }
}

/// Partial presence update. Absent fields are left untouched.
///
/// `cursor` is a double option: `Some(None)` clears the cursor (sent as
/// `null`), `None` leaves it alone (omitted).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub cursor: Option<Option<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl PresencePatch {
    pub fn cursor(position: Point) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn selection<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self {
            selection: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Fold a later patch into this one; later fields win.
    pub fn merge(&mut self, later: PresencePatch) {
        if later.user_name.is_some() {
            self.user_name = later.user_name;
        }
        if later.color.is_some() {
            self.color = later.color;
        }
        if later.cursor.is_some() {
            self.cursor = later.cursor;
        }
        if later.selection.is_some() {
            self.selection = later.selection;
        }
        if later.tool.is_some() {
            self.tool = later.tool;
        }
        if later.viewport.is_some() {
            self.viewport = later.viewport;
        }
        if later.active.is_some() {
            self.active = later.active;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Events emitted by the [`PresenceTracker`].
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Any field of a remote presence changed.
    Updated(PresenceData),
    CursorMoved {
        client_id: String,
        cursor: Option<Point>,
    },
    SelectionChanged {
        client_id: String,
        selection: Vec<NodeId>,
    },
    /// Expired or left.
    Removed { client_id: String },
}

/// Data needed to render one remote cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorView {
    pub client_id: String,
    pub user_name: String,
    pub color: String,
    pub position: Point,
}

/// Data needed to outline one remote selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionView {
    pub client_id: String,
    pub user_name: String,
    pub color: String,
    pub selection: Vec<NodeId>,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

struct TrackerState {
    local: PresenceData,
    remote: HashMap<String, PresenceData>,
}

/// Local presence plus every live remote presence.
pub struct PresenceTracker {
    state: Arc<Mutex<TrackerState>>,
    events: EventBus<PresenceEvent>,
    time: Arc<dyn TimeSource>,
    config: PresenceConfig,
    sweep: Mutex<Option<ScheduledTask>>,
}

impl PresenceTracker {
    pub fn new(
        local_client_id: impl Into<String>,
        user_name: impl Into<String>,
        config: PresenceConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let local = PresenceData::new(
            local_client_id,
            user_name,
            CursorColor::random().to_hex(),
            time.now_ms(),
        );
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                local,
                remote: HashMap::new(),
            })),
            events: EventBus::new(),
            time,
            config,
            sweep: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> Subscription<PresenceEvent> {
        self.events.subscribe()
    }

    /// Start the periodic expiry sweep. No-op outside a tokio runtime.
    pub fn start(&self) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }
        let state = self.state.clone();
        let events = self.events.clone();
        let time = self.time.clone();
        let expiration_ms = self.config.expiration.as_millis() as u64;
        *sweep = ScheduledTask::every(self.config.cleanup_interval, move || {
            sweep_expired(&state, &events, time.now_ms(), expiration_ms);
        });
    }

    /// Merge a local change and return the delta to broadcast.
    pub fn update_local_presence(&self, patch: PresencePatch) -> PresencePatch {
        let mut state = self.state.lock();
        state.local.apply(&patch);
        state.local.last_seen = self.time.now_ms();
        patch
    }

    pub fn local(&self) -> PresenceData {
        self.state.lock().local.clone()
    }

    /// Create or merge a remote client's presence.
    pub fn update_remote_presence(&self, client_id: &str, patch: &PresencePatch) {
        let now = self.time.now_ms();
        let updated = {
            let mut state = self.state.lock();
            if client_id == state.local.client_id {
                return;
            }
            let entry = state.remote.entry(client_id.to_string()).or_insert_with(|| {
                log::debug!("presence: first sight of {client_id}");
                PresenceData::new(
                    client_id,
                    patch.user_name.clone().unwrap_or_else(|| client_id.to_string()),
                    patch
                        .color
                        .clone()
                        .unwrap_or_else(|| CursorColor::random().to_hex()),
                    now,
                )
            });
            entry.apply(patch);
            entry.last_seen = now;
            entry.clone()
        };

        self.events.emit(PresenceEvent::Updated(updated.clone()));
        if patch.cursor.is_some() {
            self.events.emit(PresenceEvent::CursorMoved {
                client_id: client_id.to_string(),
                cursor: updated.cursor,
            });
        }
        if patch.selection.is_some() {
            self.events.emit(PresenceEvent::SelectionChanged {
                client_id: client_id.to_string(),
                selection: updated.selection,
            });
        }
    }

    /// Drop a remote presence after a clean leave.
    pub fn remove_remote_presence(&self, client_id: &str) -> bool {
        let removed = self.state.lock().remote.remove(client_id).is_some();
        if removed {
            self.events.emit(PresenceEvent::Removed {
                client_id: client_id.to_string(),
            });
        }
        removed
    }

    /// Run one expiry sweep now. Returns the evicted client ids.
    pub fn cleanup_expired(&self) -> Vec<String> {
        sweep_expired(
            &self.state,
            &self.events,
            self.time.now_ms(),
            self.config.expiration.as_millis() as u64,
        )
    }

    pub fn remote(&self, client_id: &str) -> Option<PresenceData> {
        self.state.lock().remote.get(client_id).cloned()
    }

    pub fn remotes(&self) -> Vec<PresenceData> {
        self.state.lock().remote.values().cloned().collect()
    }

    pub fn remote_count(&self) -> usize {
        self.state.lock().remote.len()
    }

    /// Cursors to draw: live, active and positioned.
    pub fn active_cursors(&self) -> Vec<CursorView> {
        let now = self.time.now_ms();
        let expiration_ms = self.config.expiration.as_millis() as u64;
        let state = self.state.lock();
        let mut cursors: Vec<CursorView> = state
            .remote
            .values()
            .filter(|p| p.active && !p.is_expired(now, expiration_ms))
            .filter_map(|p| {
                p.cursor.map(|position| CursorView {
                    client_id: p.client_id.clone(),
                    user_name: p.user_name.clone(),
                    color: p.color.clone(),
                    position,
                })
            })
            .collect();
        cursors.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        cursors
    }

    /// Selections to outline: live and non-empty.
    pub fn active_selections(&self) -> Vec<SelectionView> {
        let now = self.time.now_ms();
        let expiration_ms = self.config.expiration.as_millis() as u64;
        let state = self.state.lock();
        let mut selections: Vec<SelectionView> = state
            .remote
            .values()
            .filter(|p| !p.selection.is_empty() && !p.is_expired(now, expiration_ms))
            .map(|p| SelectionView {
                client_id: p.client_id.clone(),
                user_name: p.user_name.clone(),
                color: p.color.clone(),
                selection: p.selection.clone(),
            })
            .collect();
        selections.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        selections
    }

    /// Stop the sweep timer.
    pub fn dispose(&self) {
        if let Some(task) = self.sweep.lock().take() {
            task.cancel();
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn sweep_expired(
    state: &Mutex<TrackerState>,
    events: &EventBus<PresenceEvent>,
    now_ms: u64,
    expiration_ms: u64,
) -> Vec<String> {
    let evicted: Vec<String> = {
        let mut state = state.lock();
        let stale: Vec<String> = state
            .remote
            .iter()
            .filter(|(_, p)| p.is_expired(now_ms, expiration_ms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.remote.remove(id);
        }
        stale
    };

    for client_id in &evicted {
        log::debug!("presence: {client_id} expired");
        events.emit(PresenceEvent::Removed {
            client_id: client_id.clone(),
        });
    }
    evicted
}
