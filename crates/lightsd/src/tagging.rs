//! Tag namespace.
//!
//! A tag is a label shared across gateways. On each gateway it lives in one
//! of 64 slots (a tag id); the same label can use different ids on different
//! gateways. The registry keeps, for every label, the list of
//! (gateway, tag id) bindings, and every gateway counts how many of its bulbs
//! carry each id. A binding goes away when its refcount drops to zero.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, info, warn};

use lifx_core::{Label, SiteId, TagId, TagMask};
use lifx_protocol::{PacketType, Payload, Target, TagLabels};

use crate::event::EngineEvent;
use crate::gateway::Gateway;

// ============================================================================
// Tag Registry
// ============================================================================

/// One label and where it is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub label: Label,
    /// Gateway peer and the id the label uses there.
    pub bindings: Vec<(SocketAddr, TagId)>,
}

impl Tag {
    /// Id the tag uses on `gateway`.
    pub fn id_on(&self, gateway: SocketAddr) -> Option<TagId> {
        self.bindings
            .iter()
            .find(|(peer, _)| *peer == gateway)
            .map(|(_, id)| *id)
    }
}

/// Snapshot of a tag for `list_tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagView {
    pub label: String,
    pub bindings: Vec<TagBindingView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagBindingView {
    pub gateway: SocketAddr,
    pub site: SiteId,
    pub tag_id: TagId,
}

/// Directory of known tags.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: HashMap<Label, Tag>,
    /// Tag lifecycle events, drained by the engine.
    events: Vec<EngineEvent>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, label: &Label) -> Option<&Tag> {
        self.tags.get(label)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Tags sorted by label.
    pub fn iter_sorted(&self) -> Vec<&Tag> {
        let mut tags: Vec<&Tag> = self.tags.values().collect();
        tags.sort_by(|a, b| a.label.as_bytes().cmp(b.label.as_bytes()));
        tags
    }

    pub(crate) fn drain_events(&mut self) -> impl Iterator<Item = EngineEvent> + '_ {
        self.events.drain(..)
    }

    /// Binds `label` to `id` on `gateway`, creating the tag if needed.
    pub fn incref(&mut self, label: Label, gateway: SocketAddr, id: TagId) {
        let tag = self.tags.entry(label).or_insert_with(|| {
            info!(tag = %label, "discovered tag");
            self.events.push(EngineEvent::TagDiscovered {
                label: label.to_string_lossy(),
            });
            Tag {
                label,
                bindings: Vec::new(),
            }
        });
        match tag.id_on(gateway) {
            Some(existing) => debug_assert_eq!(existing, id),
            None => {
                info!(tag = %label, gateway = %gateway, tag_id = %id, "tag added to gateway");
                tag.bindings.push((gateway, id));
            }
        }
    }

    /// Removes the binding of `label` on `gateway`; a tag left without
    /// bindings is forgotten.
    pub fn decref(&mut self, label: &Label, gateway: SocketAddr) {
        let Some(tag) = self.tags.get_mut(label) else {
            return;
        };
        let before = tag.bindings.len();
        tag.bindings.retain(|(peer, _)| *peer != gateway);
        if tag.bindings.len() != before {
            debug!(tag = %label, gateway = %gateway, "tag removed from gateway");
        }
        if tag.bindings.is_empty() {
            info!(tag = %label, "forgetting unused tag");
            self.tags.remove(label);
            self.events.push(EngineEvent::TagForgotten {
                label: label.to_string_lossy(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Gateway tag slots
    // ------------------------------------------------------------------------

    /// Allocates a tag id for `label` on `gw`.
    ///
    /// Without a requested id the lowest free slot is used; `None` is
    /// returned when all 64 are taken. A slot that is already allocated is
    /// returned unchanged.
    pub fn allocate(
        &mut self,
        gw: &mut Gateway,
        requested: Option<TagId>,
        label: Label,
    ) -> Option<TagId> {
        let id = match requested {
            Some(id) => id,
            None => gw.tag_ids.lowest_unset()?,
        };
        if gw.tag_ids.contains(id) {
            return Some(id);
        }
        self.incref(label, gw.peer(), id);
        gw.set_tag_label(id, label);
        gw.tag_ids = gw.tag_ids.with(id);
        debug!(gateway = %gw.peer(), tag = %label, tag_id = %id, "allocated tag id");
        Some(id)
    }

    /// Releases a tag id on `gw`. Unallocated ids are ignored.
    pub fn deallocate(&mut self, gw: &mut Gateway, id: TagId) {
        if !gw.tag_ids.contains(id) {
            return;
        }
        let label = gw.tag_label(id).copied().unwrap_or_default();
        self.decref(&label, gw.peer());
        gw.set_tag_label(id, Label::EMPTY);
        gw.tag_ids = gw.tag_ids.without(id);
        debug!(gateway = %gw.peer(), tag = %label, tag_id = %id, "released tag id");
    }

    /// Releases every tag id of a gateway that is going away.
    pub fn release_gateway(&mut self, gw: &mut Gateway) {
        for id in gw.tag_ids.iter() {
            self.deallocate(gw, id);
        }
    }

    /// Adjusts `gw` refcounts after a bulb's tags went from `old` to `new`.
    ///
    /// An id whose count drops to zero is released, and the gateway is told
    /// to clear the label of that slot.
    pub fn update_refcounts(&mut self, gw: &mut Gateway, old: TagMask, new: TagMask) {
        if old == new {
            return;
        }

        for id in (new & !old).iter() {
            let Some(count) = gw.tag_refcount_mut(id) else {
                continue;
            };
            if *count == u8::MAX {
                warn!(gateway = %gw.peer(), tag_id = %id, "tag refcount overflow");
                continue;
            }
            *count += 1;
        }

        for id in (old & !new).iter() {
            let Some(count) = gw.tag_refcount_mut(id) else {
                continue;
            };
            debug_assert!(*count > 0, "tag refcount underflow");
            *count = count.saturating_sub(1);
            if *count > 0 {
                continue;
            }
            self.deallocate(gw, id);
            let payload = Payload::TagLabels(TagLabels {
                tags: !gw.tag_ids,
                label: Label::EMPTY,
            });
            if let Err(e) = gw.send(PacketType::SetTagLabels, Target::Site, payload) {
                warn!(gateway = %gw.peer(), tag_id = %id, error = %e, "cannot clear tag label");
            }
        }
    }
}
