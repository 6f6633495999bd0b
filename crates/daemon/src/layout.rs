//! Split-pane layouts.
//!
//! Groups live in a flat arena keyed by id. A pane is either a session id or
//! the id of a nested group, so the tree never holds references to itself.
//! This module only models the arrangement; killing or detaching the
//! sessions behind the panes is up to the caller.

use std::collections::HashMap;

use protocol::messages::{GroupView, PaneView};
use protocol::{Layout, Orientation, PanePosition};
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionId;

/// Unique identifier for a split group.
pub type GroupId = String;

const DEFAULT_SPLIT_RATIO: f32 = 0.5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("split group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("pane {pane} is not part of group {group}")]
    PaneNotInGroup { group: GroupId, pane: String },

    #[error("pane {0} already belongs to a group")]
    PaneAlreadyGrouped(String),
}

/// One pane of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaneRef {
    Session(SessionId),
    Group(GroupId),
}

impl PaneRef {
    pub fn id(&self) -> &str {
        match self {
            PaneRef::Session(id) | PaneRef::Group(id) => id,
        }
    }

    fn to_view(&self) -> PaneView {
        match self {
            PaneRef::Session(id) => PaneView::Session(id.clone()),
            PaneRef::Group(id) => PaneView::Group(id.clone()),
        }
    }
}

/// A layout container.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitGroup {
    pub id: GroupId,
    pub layout: Layout,
    pub panes: Vec<PaneRef>,
    /// Share of the first pane. Ignored for `Single`.
    pub split_ratio: f32,
    /// Set while the whole arrangement is detached.
    pub detached: bool,
}

impl SplitGroup {
    fn new(layout: Layout, panes: Vec<PaneRef>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            layout,
            panes,
            split_ratio: DEFAULT_SPLIT_RATIO,
            detached: false,
        }
    }

    pub fn to_view(&self) -> GroupView {
        GroupView {
            id: self.id.clone(),
            layout: self.layout,
            panes: self.panes.iter().map(PaneRef::to_view).collect(),
            split_ratio: self.split_ratio,
            detached: self.detached,
        }
    }

    fn position_of(&self, pane: &PaneRef) -> Option<usize> {
        self.panes.iter().position(|p| p == pane)
    }
}

/// Result of removing a pane from a group.
#[derive(Debug, Clone, PartialEq)]
pub struct PaneRemoval {
    /// Sessions that were inside the removed pane.
    pub sessions: Vec<SessionId>,
    /// The group after collapse, or `None` if it ceased to exist.
    pub group: Option<SplitGroup>,
}

/// What a reattach request resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum ReattachTarget {
    /// A single session outside any detached group.
    Session(SessionId),
    /// A whole top-level group and every session in it, in pane order.
    Group {
        group: SplitGroup,
        sessions: Vec<SessionId>,
    },
}

/// Arena of split groups.
#[derive(Debug, Default)]
pub struct LayoutManager {
    groups: HashMap<GroupId, SplitGroup>,
    /// Containing group of every grouped pane.
    parent: HashMap<PaneRef, GroupId>,
}

impl LayoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group_id: &str) -> Option<&SplitGroup> {
        self.groups.get(group_id)
    }

    pub fn contains_group(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Top-level groups, i.e. those not nested in another group.
    pub fn top_level_groups(&self) -> Vec<&SplitGroup> {
        let mut groups: Vec<&SplitGroup> = self
            .groups
            .values()
            .filter(|g| !self.parent.contains_key(&PaneRef::Group(g.id.clone())))
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    /// Every group, nested ones included.
    pub fn groups(&self) -> Vec<&SplitGroup> {
        let mut groups: Vec<&SplitGroup> = self.groups.values().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Interprets an id as a group if one exists with it, else as a session.
    pub fn pane_ref(&self, id: &str) -> PaneRef {
        if self.groups.contains_key(id) {
            PaneRef::Group(id.to_string())
        } else {
            PaneRef::Session(id.to_string())
        }
    }

    /// Group directly containing a session.
    pub fn group_of(&self, session_id: &str) -> Option<&GroupId> {
        self.parent.get(&PaneRef::Session(session_id.to_string()))
    }

    /// Outermost group containing `group_id` (itself if not nested).
    pub fn top_level(&self, group_id: &str) -> GroupId {
        let mut current = group_id.to_string();
        while let Some(parent) = self.parent.get(&PaneRef::Group(current.clone())) {
            current = parent.clone();
        }
        current
    }

    /// Every session under a group, in pane order.
    pub fn sessions_of(&self, group_id: &str) -> Vec<SessionId> {
        let mut sessions = Vec::new();
        self.collect_sessions(group_id, &mut sessions);
        sessions
    }

    fn collect_sessions(&self, group_id: &str, out: &mut Vec<SessionId>) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        for pane in &group.panes {
            match pane {
                PaneRef::Session(id) => out.push(id.clone()),
                PaneRef::Group(id) => self.collect_sessions(id, out),
            }
        }
    }

    fn sessions_of_pane(&self, pane: &PaneRef) -> Vec<SessionId> {
        match pane {
            PaneRef::Session(id) => vec![id.clone()],
            PaneRef::Group(id) => self.sessions_of(id),
        }
    }

    fn set_detached(&mut self, group_id: &str, detached: bool) {
        let nested: Vec<GroupId> = match self.groups.get_mut(group_id) {
            Some(group) => {
                group.detached = detached;
                group
                    .panes
                    .iter()
                    .filter_map(|p| match p {
                        PaneRef::Group(id) => Some(id.clone()),
                        PaneRef::Session(_) => None,
                    })
                    .collect()
            }
            None => return,
        };
        for id in nested {
            self.set_detached(&id, detached);
        }
    }

    fn insert_group(&mut self, group: SplitGroup) -> GroupId {
        let id = group.id.clone();
        for pane in &group.panes {
            self.parent.insert(pane.clone(), id.clone());
        }
        self.groups.insert(id.clone(), group);
        id
    }

    fn ordered(existing: PaneRef, new: PaneRef, position: PanePosition) -> Vec<PaneRef> {
        match position {
            PanePosition::Before => vec![new, existing],
            PanePosition::After => vec![existing, new],
        }
    }

    /// Places `new_session` next to `existing`.
    ///
    /// - A standalone session becomes a new two-pane group.
    /// - Inside a `Single` group, or a group already laid out in the same
    ///   orientation, the new pane is inserted beside the existing one.
    /// - Inside a group with the other orientation, the existing pane is
    ///   replaced by a nested group holding both.
    /// - Splitting a whole group keeps its id as the outer container.
    ///
    /// Returns the group that directly contains the new pane.
    pub fn split(
        &mut self,
        existing: &str,
        new_session: &str,
        orientation: Orientation,
        position: PanePosition,
    ) -> Result<SplitGroup, LayoutError> {
        let new_pane = PaneRef::Session(new_session.to_string());
        if self.parent.contains_key(&new_pane) {
            return Err(LayoutError::PaneAlreadyGrouped(new_session.to_string()));
        }
        let layout = Layout::from(orientation);

        let group_id = match self.pane_ref(existing) {
            PaneRef::Group(group_id) => self.split_group(&group_id, new_pane, layout, position),
            pane @ PaneRef::Session(_) => match self.parent.get(&pane).cloned() {
                Some(group_id) => self.split_within(&group_id, pane, new_pane, layout, position),
                None => {
                    let group = SplitGroup::new(layout, Self::ordered(pane, new_pane, position));
                    self.insert_group(group)
                }
            },
        };

        let group = self
            .groups
            .get(&group_id)
            .cloned()
            .ok_or(LayoutError::GroupNotFound(group_id))?;
        tracing::debug!(group_id = %group.id, panes = group.panes.len(), layout = ?group.layout, "Split pane");
        Ok(group)
    }

    fn split_within(
        &mut self,
        group_id: &str,
        existing: PaneRef,
        new_pane: PaneRef,
        layout: Layout,
        position: PanePosition,
    ) -> GroupId {
        let Some(group) = self.groups.get_mut(group_id) else {
            return group_id.to_string();
        };
        let index = group.position_of(&existing).unwrap_or(group.panes.len());

        if group.layout == Layout::Single || group.layout == layout {
            group.layout = layout;
            let at = match position {
                PanePosition::Before => index,
                PanePosition::After => (index + 1).min(group.panes.len()),
            };
            group.panes.insert(at, new_pane.clone());
            self.parent.insert(new_pane, group_id.to_string());
            return group_id.to_string();
        }

        let nested = SplitGroup::new(layout, Self::ordered(existing.clone(), new_pane, position));
        let nested_pane = PaneRef::Group(nested.id.clone());
        if let Some(slot) = group.panes.get_mut(index) {
            *slot = nested_pane.clone();
        }
        let detached = group.detached;
        let nested_id = self.insert_group(nested);
        self.parent.insert(nested_pane, group_id.to_string());
        if let Some(nested) = self.groups.get_mut(&nested_id) {
            nested.detached = detached;
        }
        nested_id
    }

    fn split_group(
        &mut self,
        group_id: &str,
        new_pane: PaneRef,
        layout: Layout,
        position: PanePosition,
    ) -> GroupId {
        let Some(group) = self.groups.get_mut(group_id) else {
            return group_id.to_string();
        };

        if group.layout == Layout::Single || group.layout == layout {
            group.layout = layout;
            match position {
                PanePosition::Before => group.panes.insert(0, new_pane.clone()),
                PanePosition::After => group.panes.push(new_pane.clone()),
            }
            self.parent.insert(new_pane, group_id.to_string());
            return group_id.to_string();
        }

        // Move the current content into a nested group so the outer id stays.
        let mut inner = SplitGroup::new(group.layout, std::mem::take(&mut group.panes));
        inner.split_ratio = group.split_ratio;
        inner.detached = group.detached;
        let inner_pane = PaneRef::Group(inner.id.clone());

        group.layout = layout;
        group.split_ratio = DEFAULT_SPLIT_RATIO;
        group.panes = Self::ordered(inner_pane.clone(), new_pane.clone(), position);

        self.insert_group(inner);
        self.parent.insert(inner_pane, group_id.to_string());
        self.parent.insert(new_pane, group_id.to_string());
        group_id.to_string()
    }

    fn take_pane(&mut self, group_id: &str, pane_id: &str) -> Result<PaneRef, LayoutError> {
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| LayoutError::GroupNotFound(group_id.to_string()))?;
        let index = group
            .panes
            .iter()
            .position(|p| p.id() == pane_id)
            .ok_or_else(|| LayoutError::PaneNotInGroup {
                group: group_id.to_string(),
                pane: pane_id.to_string(),
            })?;
        let pane = group.panes.remove(index);
        self.parent.remove(&pane);
        Ok(pane)
    }

    /// Removes a group and everything nested in it from the arena.
    fn destroy(&mut self, group_id: &str) {
        if let Some(group) = self.groups.remove(group_id) {
            for pane in group.panes {
                self.parent.remove(&pane);
                if let PaneRef::Group(id) = pane {
                    self.destroy(&id);
                }
            }
        }
    }

    /// Shrinks a group after a pane left it.
    ///
    /// One remaining pane collapses the group to `Single` in place, keeping
    /// its id; if that pane is a nested group, its content is adopted. An
    /// empty group is removed, and its own parent collapses in turn.
    fn collapse(&mut self, group_id: &str) -> Option<SplitGroup> {
        let remaining = self.groups.get(group_id)?.panes.len();
        match remaining {
            0 => {
                self.groups.remove(group_id);
                let me = PaneRef::Group(group_id.to_string());
                if let Some(parent_id) = self.parent.remove(&me) {
                    if let Some(parent) = self.groups.get_mut(&parent_id) {
                        parent.panes.retain(|p| p != &me);
                    }
                    self.collapse(&parent_id);
                }
                None
            }
            1 => {
                let only = self.groups.get(group_id)?.panes[0].clone();
                if let PaneRef::Group(inner_id) = &only {
                    if let Some(inner) = self.groups.remove(inner_id) {
                        self.parent.remove(&only);
                        for pane in &inner.panes {
                            self.parent.insert(pane.clone(), group_id.to_string());
                        }
                        let group = self.groups.get_mut(group_id)?;
                        group.layout = inner.layout;
                        group.panes = inner.panes;
                        group.split_ratio = inner.split_ratio;
                        return Some(group.clone());
                    }
                }
                let group = self.groups.get_mut(group_id)?;
                group.layout = Layout::Single;
                group.split_ratio = DEFAULT_SPLIT_RATIO;
                Some(group.clone())
            }
            _ => self.groups.get(group_id).cloned(),
        }
    }

    /// Removes a pane whose sessions are being killed.
    pub fn close_pane(&mut self, group_id: &str, pane_id: &str) -> Result<PaneRemoval, LayoutError> {
        let pane = self.take_pane(group_id, pane_id)?;
        let sessions = self.sessions_of_pane(&pane);
        if let PaneRef::Group(id) = &pane {
            self.destroy(id);
        }
        let group = self.collapse(group_id);
        tracing::debug!(group_id = %group_id, pane_id = %pane_id, remaining = ?group.as_ref().map(|g| g.panes.len()), "Closed pane");
        Ok(PaneRemoval { sessions, group })
    }

    /// Takes a pane out of a group without killing anything.
    ///
    /// A session pane becomes standalone; a group pane becomes its own
    /// detached top-level group.
    pub fn detach_pane(&mut self, group_id: &str, pane_id: &str) -> Result<PaneRemoval, LayoutError> {
        let pane = self.take_pane(group_id, pane_id)?;
        let sessions = self.sessions_of_pane(&pane);
        if let PaneRef::Group(id) = &pane {
            self.set_detached(id, true);
        }
        let group = self.collapse(group_id);
        tracing::debug!(group_id = %group_id, pane_id = %pane_id, "Detached pane");
        Ok(PaneRemoval { sessions, group })
    }

    /// Marks a whole group detached, keeping its structure.
    ///
    /// Returns every session in the group.
    pub fn detach_group(&mut self, group_id: &str) -> Result<(SplitGroup, Vec<SessionId>), LayoutError> {
        if !self.groups.contains_key(group_id) {
            return Err(LayoutError::GroupNotFound(group_id.to_string()));
        }
        self.set_detached(group_id, true);
        let group = self
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| LayoutError::GroupNotFound(group_id.to_string()))?;
        Ok((group, self.sessions_of(group_id)))
    }

    /// Clears the detached flag on a group and everything nested in it.
    pub fn mark_attached(&mut self, group_id: &str) -> Option<SplitGroup> {
        if !self.groups.contains_key(group_id) {
            return None;
        }
        self.set_detached(group_id, false);
        self.groups.get(group_id).cloned()
    }

    /// Resolves a reattach target.
    ///
    /// A group id, nested or not, resolves to its top-level group. A session
    /// inside a detached group resolves to that whole group, so its siblings
    /// come back with it. Anything else is a plain session. The group keeps
    /// its detached flag until [`LayoutManager::mark_attached`] is called.
    pub fn reattach(&self, id: &str) -> ReattachTarget {
        let top = match self.pane_ref(id) {
            PaneRef::Group(group_id) => Some(self.top_level(&group_id)),
            pane @ PaneRef::Session(_) => self
                .parent
                .get(&pane)
                .map(|g| self.top_level(g))
                .filter(|top| self.groups.get(top).map(|g| g.detached).unwrap_or(false)),
        };

        match top.and_then(|top| self.groups.get(&top).cloned()) {
            Some(group) => {
                let sessions = self.sessions_of(&group.id);
                ReattachTarget::Group { group, sessions }
            }
            None => ReattachTarget::Session(id.to_string()),
        }
    }

    /// Removes a group and its nested groups. The sessions become standalone
    /// and are returned.
    pub fn teardown(&mut self, group_id: &str) -> Result<Vec<SessionId>, LayoutError> {
        if !self.groups.contains_key(group_id) {
            return Err(LayoutError::GroupNotFound(group_id.to_string()));
        }
        let sessions = self.sessions_of(group_id);
        let me = PaneRef::Group(group_id.to_string());
        let parent = self.parent.remove(&me);
        self.destroy(group_id);
        if let Some(parent_id) = parent {
            if let Some(group) = self.groups.get_mut(&parent_id) {
                group.panes.retain(|p| p != &me);
            }
            self.collapse(&parent_id);
        }
        Ok(sessions)
    }

    /// Drops a session from whatever group holds it.
    ///
    /// Returns the containing group after collapse, if it still exists.
    pub fn remove_session(&mut self, session_id: &str) -> Option<SplitGroup> {
        let pane = PaneRef::Session(session_id.to_string());
        let group_id = self.parent.remove(&pane)?;
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.panes.retain(|p| p != &pane);
        }
        self.collapse(&group_id)
    }
}
